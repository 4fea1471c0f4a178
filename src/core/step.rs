//! The step abstraction: a unit of work plus its compensating cleanup.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::state::{StateBag, StateKey};
use crate::error::BuildError;

/// Control signal returned by `Step::run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step
    Continue,
    /// Stop the pipeline; a terminal error has been recorded
    Halt,
}

/// A single stage of a build.
///
/// `run` is called at most once per build. `cleanup` is called once for
/// every step whose `run` was started, in reverse order, whatever the
/// outcome. Cleanup must tolerate a `run` that created nothing and its
/// errors are only logged.
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &'static str;

    /// Keys this step may read from the state container
    fn reads(&self) -> &'static [StateKey] {
        &[]
    }

    /// Keys this step may write to the state container
    fn writes(&self) -> &'static [StateKey] {
        &[]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction;

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Record `err` as the terminal error and halt
pub fn halt(state: &mut StateBag, step: &str, err: BuildError) -> StepAction {
    error!(step, error = %err, "Step halted");
    state.set_error(err);
    StepAction::Halt
}
