//! Polling of asynchronous remote state transitions.
//!
//! Remote operations return immediately while the resource transitions in
//! the background. `wait_for` re-probes at a fixed interval until the probe
//! reports a terminal state, the overall budget is spent, or the build is
//! cancelled. Remote-call failures while probing are retried silently
//! until the budget runs out.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BuildError, CloudError};

/// Interval and budget for one kind of wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between probes in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Overall budget in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_interval_ms() -> u64 {
    5000
}
fn default_timeout_seconds() -> u64 {
    1800
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl PollPolicy {
    /// Sub-second budgets round up to whole seconds so they never become zero
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            timeout_seconds: timeout.as_millis().div_ceil(1000) as u64,
        }
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Terminal success
    Ready(T),
    /// Still transitioning
    Pending,
    /// Terminal failure reported by the control plane
    Failed(String),
}

/// Probe until ready, failed, timed out or cancelled
pub async fn wait_for<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &PollPolicy,
    what: &str,
    mut probe: F,
) -> Result<T, BuildError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, CloudError>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout();
    let mut attempts = 0u32;
    let mut last_error: Option<CloudError> = None;

    loop {
        attempts += 1;

        // A status check that never returns still counts against the budget
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::cancelled(format!("waiting for {}", what))),
            outcome = probe() => outcome,
            _ = sleep_until(deadline) => {
                warn!(what, attempts, "Status check still outstanding at deadline");
                return Err(BuildError::Timeout {
                    what: what.to_string(),
                    waited: started.elapsed(),
                });
            }
        };

        match outcome {
            Ok(Probe::Ready(value)) => {
                debug!(what, attempts, "Wait finished");
                return Ok(value);
            }
            Ok(Probe::Failed(reason)) => {
                return Err(BuildError::remote(
                    format!("{} reached a failed state", what),
                    CloudError::request("Describe", reason),
                ));
            }
            Ok(Probe::Pending) => {
                debug!(what, attempts, "Still waiting");
            }
            Err(err) => {
                debug!(what, attempts, error = %err, "Probe failed, retrying");
                last_error = Some(err);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            if let Some(err) = &last_error {
                warn!(what, error = %err, "Last probe error before timeout");
            }
            return Err(BuildError::Timeout {
                what: what.to_string(),
                waited: now - started,
            });
        }

        let nap = policy.interval().min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::cancelled(format!("waiting for {}", what))),
            _ = sleep(nap) => {}
        }
    }
}
