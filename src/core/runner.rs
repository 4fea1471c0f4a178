//! Sequential step runner.
//!
//! Runs steps strictly one at a time. A `Halt` or a cancelled token stops
//! the pipeline; afterwards every started step is cleaned up in reverse
//! start order. A panicking step halts the pipeline like any other failure.
//! A failing or panicking cleanup is logged and the remaining cleanups
//! still run.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::state::{StateBag, StateKey};
use super::step::{Step, StepAction};
use crate::domain::{RunState, RunSummary, StepStatus};
use crate::error::BuildError;

/// Executes an ordered list of steps against a state container
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Runner {
    /// Build a runner, checking that every key a step reads is seeded or
    /// written by an earlier step
    pub fn new(steps: Vec<Box<dyn Step>>, seeded: &[StateKey]) -> Result<Self, BuildError> {
        let mut available: BTreeSet<StateKey> = seeded.iter().copied().collect();
        let mut problems = Vec::new();

        for step in &steps {
            for key in step.reads() {
                if !available.contains(key) {
                    problems.push(format!(
                        "step '{}' reads '{}' before any step writes it",
                        step.name(),
                        key.as_str()
                    ));
                }
            }
            available.extend(step.writes().iter().copied());
        }

        if !problems.is_empty() {
            return Err(BuildError::Validation(problems));
        }

        Ok(Self { steps })
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step, then clean up the ones that started.
    ///
    /// The outcome of the build is left in `state`.
    #[instrument(skip_all, fields(steps = self.steps.len()))]
    pub async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> RunSummary {
        let mut summary = RunSummary::new();
        let mut started = 0usize;
        let mut final_state = RunState::Completed;

        for step in self.steps.iter_mut() {
            if cancel.is_cancelled() {
                warn!(next_step = step.name(), "Build cancelled, not starting further steps");
                if state.error().is_none() {
                    state.set_error(BuildError::cancelled(format!(
                        "starting step '{}'",
                        step.name()
                    )));
                }
                final_state = RunState::Cancelled;
                break;
            }

            // Counted before run so a partially run step is still cleaned up
            started += 1;
            let step_start = Instant::now();
            info!(step = step.name(), "Running step");

            let action = match AssertUnwindSafe(step.run(cancel, state)).catch_unwind().await {
                Ok(action) => action,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(step = step.name(), %message, "Step panicked");
                    // Replaces any error the step recorded before panicking
                    state.set_error(BuildError::StepPanicked {
                        step: step.name().to_string(),
                        message,
                    });
                    StepAction::Halt
                }
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match action {
                StepAction::Continue => {
                    summary.record_step(step.name(), StepStatus::Completed, duration_ms);
                }
                StepAction::Halt => {
                    summary.record_step(step.name(), StepStatus::Halted, duration_ms);
                    if state.error().is_none() {
                        state.set_error(BuildError::Precondition(format!(
                            "step '{}' halted without reporting an error",
                            step.name()
                        )));
                    }
                    final_state = RunState::Halted {
                        step: step.name().to_string(),
                    };
                    break;
                }
            }
        }

        for (index, step) in self.steps[..started].iter_mut().enumerate().rev() {
            let name = step.name();
            let outcome = AssertUnwindSafe(step.cleanup(state)).catch_unwind().await;

            let cleanup_error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => {
                    warn!(step = name, error = %err, "Cleanup failed");
                    Some(format!("{:#}", err))
                }
                Err(_) => {
                    error!(step = name, "Cleanup panicked");
                    Some("cleanup panicked".to_string())
                }
            };
            summary.record_cleanup(index, cleanup_error);
        }

        summary.finish(final_state);
        info!(state = ?summary.state, "Runner finished");
        summary
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
