//! cvmbake - Machine image builder for a cloud control plane
//!
//! Launches a temporary instance from a source image, provisions it,
//! snapshots it into a new image and optionally shares and copies that
//! image to other accounts and regions.
//!
//! # Architecture
//!
//! A build is a fixed, linear sequence of steps sharing one state
//! container:
//! - Each step acquires or creates one remote resource and records it
//! - A failed or cancelled step stops the sequence
//! - Every started step is cleaned up in reverse order, whatever happened
//! - The final state is assembled into an artifact, an error, or both
//!
//! # Modules
//!
//! - `adapters`: Control plane and provisioner interfaces, plus the
//!   simulated control plane
//! - `core`: State, steps contract, runner, polling, assembly, builder
//! - `steps`: The individual build steps
//! - `domain`: Artifact and run summary
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a configuration
//! cvmbake validate --config cvmbake.yaml
//!
//! # Rehearse a build and keep the manifest
//! cvmbake build --manifest manifest.json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod steps;

// Re-export main types at crate root for convenience
pub use adapters::{CloudClient, Provisioner, SimulatedCloud};
pub use config::BuildConfig;
pub use crate::core::{BuildOutcome, BuildReport, ImageBuilder};
pub use domain::{Artifact, ArtifactManifest, RunSummary};
pub use error::{BuildError, CloudError};
