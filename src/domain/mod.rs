//! Domain types for the image builder.
//!
//! - Artifact: images left behind by a successful build
//! - Run: what the runner did, step by step

pub mod artifact;
pub mod run;

pub use artifact::{Artifact, ArtifactManifest, BUILDER_ID};
pub use run::{RunState, RunSummary, StepRecord, StepStatus};
