//! Command-line interface for cvmbake.
//!
//! Provides commands for running a build, validating a configuration and
//! showing the resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::{CommandProvisioner, NoopProvisioner, Provisioner, SimulatedCloud};
use crate::config::{BuildConfig, ProvisionConfig};
use crate::core::{BuildOutcome, BuildReport, ImageBuilder};
use crate::domain::RunSummary;

/// cvmbake - Bake machine images from a source image
#[derive(Parser, Debug)]
#[command(name = "cvmbake")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build against the simulated control plane
    Build {
        /// Config file (defaults to the nearest cvmbake.yaml)
        #[arg(short, long, env = "CVMBAKE_CONFIG")]
        config: Option<PathBuf>,

        /// Write the artifact manifest as JSON to this path
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Validate a configuration without building
    Validate {
        /// Config file (defaults to the nearest cvmbake.yaml)
        #[arg(short, long, env = "CVMBAKE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show resolved configuration (secrets redacted)
    Config {
        /// Config file (defaults to the nearest cvmbake.yaml)
        #[arg(short, long, env = "CVMBAKE_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build { config, manifest } => {
                build(config.as_deref(), manifest.as_deref()).await
            }
            Commands::Validate { config } => validate(config.as_deref()),
            Commands::Config { config } => show_config(config.as_deref()),
        }
    }
}

/// Provisioner for the configured commands
pub fn provisioner_for(config: &ProvisionConfig) -> Arc<dyn Provisioner> {
    if config.commands.is_empty() {
        Arc::new(NoopProvisioner)
    } else {
        Arc::new(CommandProvisioner::new(
            config.commands.clone(),
            Duration::from_secs(config.command_timeout_seconds),
        ))
    }
}

async fn build(config_path: Option<&Path>, manifest_path: Option<&Path>) -> Result<()> {
    let (config, path) = BuildConfig::load(config_path)?;
    eprintln!("Using config: {}", path.display());

    let cloud = SimulatedCloud::new(config.access.region.clone())
        .with_image(&config.run.source_image_id, "source-image");
    let provisioner = provisioner_for(&config.provision);
    let builder = ImageBuilder::new(config, Arc::new(cloud), provisioner);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling build");
            interrupt.cancel();
        }
    });

    let BuildReport { outcome, summary } = builder.run(&cancel).await;
    if let Some(summary) = &summary {
        print_summary(summary);
    }

    if let (Some(path), Some(artifact)) = (manifest_path, outcome.artifact()) {
        let json = serde_json::to_string_pretty(&artifact.manifest())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        eprintln!("Manifest written to {}", path.display());
    }

    let success = outcome.is_success();
    match outcome {
        BuildOutcome::Built(artifact) => print!("{}", artifact),
        BuildOutcome::Skipped => println!("No image was created"),
        BuildOutcome::Partial { artifact, error } => {
            print!("{}", artifact);
            eprintln!("\n[Build incomplete: {}]", error);
        }
        BuildOutcome::Failed(error) => eprintln!("\n[Build failed: {}]", error),
    }

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    eprintln!("Run {}", summary.id);
    for step in &summary.steps {
        eprintln!("  {:<24} {:?} ({} ms)", step.name, step.status, step.duration_ms);
    }
    for step in summary.cleanup_failures() {
        if let Some(error) = &step.cleanup_error {
            eprintln!("  cleanup of {} failed: {}", step.name, error);
        }
    }
}

fn validate(config_path: Option<&Path>) -> Result<()> {
    let (config, path) = BuildConfig::load(config_path)?;

    match config.validate() {
        Ok(()) => {
            println!("{} is valid", path.display());
            Ok(())
        }
        Err(err) => {
            eprintln!("{}: {}", path.display(), err);
            std::process::exit(1);
        }
    }
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let (mut config, path) = BuildConfig::load(config_path)?;
    if config.access.secret_key.is_some() {
        config.access.secret_key = Some("<redacted>".to_string());
    }

    println!("# {}", path.display());
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
