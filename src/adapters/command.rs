//! Shell command provisioner.
//!
//! Runs each configured command through `sh -c`, exposing the build
//! instance to the command through environment variables. Commands run
//! sequentially and the first failure stops provisioning.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ProvisionTarget, Provisioner};

pub const ENV_INSTANCE_ID: &str = "CVMBAKE_INSTANCE_ID";
pub const ENV_INSTANCE_ADDRESS: &str = "CVMBAKE_INSTANCE_ADDRESS";

/// Provisioner that shells out to user commands
pub struct CommandProvisioner {
    commands: Vec<String>,
    command_timeout: Duration,
    shell: String,
}

impl CommandProvisioner {
    pub fn new(commands: Vec<String>, command_timeout: Duration) -> Self {
        Self {
            commands,
            command_timeout,
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell binary (must accept `-c`)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run_command(&self, command: &str, target: &ProvisionTarget) -> Result<()> {
        let child = Command::new(&self.shell)
            .args(["-c", command])
            .env(ENV_INSTANCE_ID, &target.instance_id)
            .env(ENV_INSTANCE_ADDRESS, &target.address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn provisioning command '{}'", command))?;

        let output = timeout(self.command_timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Provisioning command '{}' timed out after {:?}",
                    command, self.command_timeout
                )
            })?
            .with_context(|| format!("Failed to wait for provisioning command '{}'", command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Provisioning command '{}' failed with exit code {}: {}",
                command,
                exit_code,
                stderr.trim()
            );
        }

        debug!(
            command,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Provisioning command finished"
        );
        Ok(())
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    fn name(&self) -> &str {
        "command"
    }

    async fn provision(&self, cancel: &CancellationToken, target: &ProvisionTarget) -> Result<()> {
        for command in &self.commands {
            info!(instance_id = %target.instance_id, command = %command, "Running provisioning command");

            // Dropping the future kills the child (kill_on_drop)
            tokio::select! {
                biased;
                _ = cancel.cancelled() => anyhow::bail!("provisioning interrupted"),
                result = self.run_command(command, target) => result?,
            }
        }
        Ok(())
    }
}

/// Provisioner used when the build has nothing to run
#[derive(Debug, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    fn name(&self) -> &str {
        "noop"
    }

    async fn provision(&self, _cancel: &CancellationToken, target: &ProvisionTarget) -> Result<()> {
        debug!(instance_id = %target.instance_id, "No provisioning commands configured");
        Ok(())
    }
}
