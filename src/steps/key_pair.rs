//! Key pair used to reach the build instance.
//!
//! A caller-supplied key is validated and reused; otherwise a temporary
//! pair is created and deleted again during cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::CloudClient;
use crate::core::state::{StateBag, StateKey, StateValue};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepConfigKeyPair {
    client: Arc<dyn CloudClient>,
    key_id: Option<String>,
    debug_key_path: Option<PathBuf>,
    created_key_id: Option<String>,
    wrote_debug_key: bool,
}

impl StepConfigKeyPair {
    pub fn new(client: Arc<dyn CloudClient>, key_id: Option<String>, debug_key_path: Option<PathBuf>) -> Self {
        Self {
            client,
            key_id,
            debug_key_path,
            created_key_id: None,
            wrote_debug_key: false,
        }
    }

    async fn reuse(&self, key_id: &str, state: &mut StateBag) -> Result<(), BuildError> {
        info!(key_id, "Using existing key pair");
        let mut key = self
            .client
            .describe_key_pair(key_id)
            .await
            .map_err(|err| BuildError::remote("failed to describe key pair", err))?
            .ok_or_else(|| BuildError::Precondition(format!("key pair '{}' not found", key_id)))?;
        // Never ours to detach or delete
        key.temporary = false;

        state.put(StateKey::KeyPair, StateValue::KeyPair(key));
        Ok(())
    }

    async fn create(&mut self, state: &mut StateBag) -> Result<(), BuildError> {
        let name = format!("cvmbake_{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(%name, "Creating temporary key pair");

        let mut key = self
            .client
            .create_key_pair(&name)
            .await
            .map_err(|err| BuildError::remote("failed to create temporary key pair", err))?;
        key.temporary = true;
        self.created_key_id = Some(key.id.clone());
        state.put(StateKey::KeyPair, StateValue::KeyPair(key.clone()));

        if let (Some(path), Some(private_key)) = (&self.debug_key_path, &key.private_key) {
            info!(path = %path.display(), "Saving temporary private key for debugging");
            tokio::fs::write(path, private_key).await.map_err(|err| {
                BuildError::Precondition(format!(
                    "failed to write debug key to {}: {}",
                    path.display(),
                    err
                ))
            })?;
            self.wrote_debug_key = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepConfigKeyPair {
    fn name(&self) -> &'static str {
        "config_key_pair"
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::KeyPair]
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let result = match self.key_id.clone() {
            Some(key_id) => self.reuse(&key_id, state).await,
            None => self.create(state).await,
        };

        match result {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        if std::mem::take(&mut self.wrote_debug_key) {
            if let Some(path) = &self.debug_key_path {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %err, "Failed to remove debug key");
                }
            }
        }

        let Some(key_id) = self.created_key_id.take() else {
            return Ok(());
        };
        info!(%key_id, "Deleting temporary key pair");
        self.client
            .delete_key_pair(&key_id)
            .await
            .with_context(|| format!("Failed to delete temporary key pair {}", key_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_existing_key_is_never_created_or_deleted() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_key_pair("skey-mine"));
        let mut step = StepConfigKeyPair::new(cloud.clone(), Some("skey-mine".into()), None);
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert!(!state.key_pair().unwrap().temporary);

        step.cleanup(&mut state).await.unwrap();
        assert_eq!(cloud.call_count("CreateKeyPair"), 0);
        assert_eq!(cloud.call_count("DeleteKeyPairs"), 0);
        assert_eq!(cloud.key_pair_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_halts() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let mut step = StepConfigKeyPair::new(cloud, Some("skey-gone".into()), None);
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        assert!(matches!(state.error(), Some(BuildError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_temporary_key_written_and_removed() {
        let temp = TempDir::new().unwrap();
        let key_path = temp.path().join("debug.pem");
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let mut step = StepConfigKeyPair::new(cloud.clone(), None, Some(key_path.clone()));
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert!(state.key_pair().unwrap().temporary);
        assert!(key_path.exists());

        step.cleanup(&mut state).await.unwrap();
        assert!(!key_path.exists());
        assert_eq!(cloud.key_pair_count(), 0);

        // Second cleanup is a no-op
        step.cleanup(&mut state).await.unwrap();
        assert_eq!(cloud.call_count("DeleteKeyPairs"), 1);
    }
}
