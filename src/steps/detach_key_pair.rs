//! Detaches the temporary key pair from the instance.
//!
//! A key pair still bound to an instance cannot be deleted, and the image
//! must not carry the temporary key, so this runs as an ordinary step
//! after provisioning rather than as part of any cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::instance::wait_for_running;
use crate::adapters::CloudClient;
use crate::core::poll::PollPolicy;
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepDetachTempKeyPair {
    client: Arc<dyn CloudClient>,
    poll: PollPolicy,
}

impl StepDetachTempKeyPair {
    pub fn new(client: Arc<dyn CloudClient>, poll: PollPolicy) -> Self {
        Self { client, poll }
    }

    async fn detach(&self, cancel: &CancellationToken, state: &StateBag) -> Result<(), BuildError> {
        let Some(key) = state.key_pair().filter(|key| key.temporary) else {
            return Ok(());
        };
        let instance_id = state.require_id(self.name(), StateKey::InstanceId)?;

        info!(key_id = %key.id, %instance_id, "Detaching temporary key pair");
        self.client
            .detach_key_pair(&instance_id, &key.id)
            .await
            .map_err(|err| BuildError::remote("failed to detach temporary key pair", err))?;

        // Detaching restarts the instance
        wait_for_running(&self.client, cancel, &self.poll, &instance_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Step for StepDetachTempKeyPair {
    fn name(&self) -> &'static str {
        "detach_temp_key_pair"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::KeyPair, StateKey::InstanceId]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        match self.detach(cancel, state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }
}
