//! Turns the final state container into a build outcome.

use std::sync::Arc;

use crate::adapters::CloudClient;
use crate::domain::Artifact;
use crate::error::BuildError;

use super::state::{StateBag, StateKey};

/// Result of a build invocation
#[derive(Debug)]
pub enum BuildOutcome {
    /// Image built (and propagated everywhere requested)
    Built(Artifact),
    /// Image built but some region copies failed
    Partial { artifact: Artifact, error: BuildError },
    /// The build failed; nothing usable was left behind
    Failed(BuildError),
    /// Image creation was skipped by configuration
    Skipped,
}

impl BuildOutcome {
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Built(artifact) | Self::Partial { artifact, .. } => Some(artifact),
            Self::Failed(_) | Self::Skipped => None,
        }
    }

    pub fn error(&self) -> Option<&BuildError> {
        match self {
            Self::Partial { error, .. } | Self::Failed(error) => Some(error),
            Self::Built(_) | Self::Skipped => None,
        }
    }

    /// Split into the `(artifact, error)` pair downstream tooling expects
    pub fn into_parts(self) -> (Option<Artifact>, Option<BuildError>) {
        match self {
            Self::Built(artifact) => (Some(artifact), None),
            Self::Partial { artifact, error } => (Some(artifact), Some(error)),
            Self::Failed(error) => (None, Some(error)),
            Self::Skipped => (None, None),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Built(_) | Self::Skipped)
    }
}

/// Inspect the state left by the runner.
///
/// A recorded error wins, except a partial-propagation error which is
/// returned alongside the images that did get copied. Without an error and
/// without an image the build intentionally produced nothing.
pub fn assemble(mut state: StateBag, client: Arc<dyn CloudClient>) -> BuildOutcome {
    let error = state.take_error();
    let has_image = state.contains(StateKey::ImageId);

    match error {
        Some(error) if error.is_partial_propagation() && has_image => {
            BuildOutcome::Partial {
                artifact: build_artifact(&state, client),
                error,
            }
        }
        Some(error) => BuildOutcome::Failed(error),
        None if !has_image => BuildOutcome::Skipped,
        None => BuildOutcome::Built(build_artifact(&state, client)),
    }
}

fn build_artifact(state: &StateBag, client: Arc<dyn CloudClient>) -> Artifact {
    Artifact::new(
        state.images().cloned().unwrap_or_default(),
        state.generated_data().cloned().unwrap_or_default(),
        client,
    )
}
