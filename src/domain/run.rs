//! Summary of a single runner execution.
//!
//! The summary is diagnostics only. Whether a build succeeded is read from
//! the state container, not from here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a started step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Returned `Continue`
    Completed,
    /// Returned `Halt`
    Halted,
}

/// Record of one started step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,

    /// Cleanup error, if the compensating action failed or panicked
    pub cleanup_error: Option<String>,
}

/// Why the runner stopped advancing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Running,
    /// Every step returned `Continue`
    Completed,
    /// A step returned `Halt`
    Halted { step: String },
    /// The build was cancelled between steps
    Cancelled,
}

/// One execution of an ordered step list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Started steps, in start order
    pub steps: Vec<StepRecord>,

    /// Step names in the order their cleanup ran
    pub cleanup_order: Vec<String>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            cleanup_order: Vec::new(),
        }
    }

    pub fn record_step(&mut self, name: &str, status: StepStatus, duration_ms: u64) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            status,
            duration_ms,
            cleanup_error: None,
        });
    }

    /// Record the cleanup of the step started at position `index`
    pub fn record_cleanup(&mut self, index: usize, error: Option<String>) {
        if let Some(record) = self.steps.get_mut(index) {
            self.cleanup_order.push(record.name.clone());
            record.cleanup_error = error;
        }
    }

    /// Names of the started steps, in start order
    pub fn started(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn cleanup_failures(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.cleanup_error.is_some())
            .collect()
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.completed_at = Some(Utc::now());
    }
}
