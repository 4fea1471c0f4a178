//! Error kinds surfaced by a build.
//!
//! A halting step records exactly one `BuildError` in the state container.
//! The Runner never wraps or reinterprets it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::state::StateKey;

/// Failure reported by the remote control plane
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("{operation} failed: {message}")]
    Request { operation: String, message: String },
}

impl CloudError {
    pub fn request(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// A single region that failed during a per-region fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionFailure {
    pub region: String,
    pub reason: String,
}

impl fmt::Display for RegionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.region, self.reason)
    }
}

/// Terminal build errors
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{context}: {source}")]
    Remote {
        context: String,
        #[source]
        source: CloudError,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("cancelled while {what}")]
    Cancelled { what: String },

    #[error("image propagation failed for {} region(s): {}", .failed.len(), join_failures(.failed))]
    PartialPropagation { failed: Vec<RegionFailure> },

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("step '{step}' panicked: {message}")]
    StepPanicked { step: String, message: String },

    #[error("step '{step}' requires state key '{}' which was never recorded", .key.as_str())]
    MissingState { step: String, key: StateKey },

    #[error("failed to delete image in {} region(s): {}", .failed.len(), join_failures(.failed))]
    Destroy { failed: Vec<RegionFailure> },
}

fn join_failures(failed: &[RegionFailure]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl BuildError {
    pub fn remote(context: impl Into<String>, source: CloudError) -> Self {
        Self::Remote {
            context: context.into(),
            source,
        }
    }

    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled { what: what.into() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_partial_propagation(&self) -> bool {
        matches!(self, Self::PartialPropagation { .. })
    }

    /// Regions named by a partial-propagation error
    pub fn failed_regions(&self) -> Vec<&str> {
        match self {
            Self::PartialPropagation { failed } | Self::Destroy { failed } => {
                failed.iter().map(|f| f.region.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}
