//! Runs the provisioning action against the running instance.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{ProvisionTarget, Provisioner};
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepProvision {
    provisioner: Arc<dyn Provisioner>,
}

impl StepProvision {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }

    fn target(&self, state: &StateBag) -> Result<ProvisionTarget, BuildError> {
        Ok(ProvisionTarget {
            instance_id: state.require_id(self.name(), StateKey::InstanceId)?,
            address: state.require_id(self.name(), StateKey::InstanceAddress)?,
        })
    }
}

#[async_trait]
impl Step for StepProvision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::InstanceId, StateKey::InstanceAddress]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let target = match self.target(state) {
            Ok(target) => target,
            Err(err) => return halt(state, self.name(), err),
        };

        info!(provisioner = self.provisioner.name(), address = %target.address, "Provisioning instance");
        match self.provisioner.provision(cancel, &target).await {
            Ok(()) => StepAction::Continue,
            Err(_) if cancel.is_cancelled() => {
                halt(state, self.name(), BuildError::cancelled("provisioning the instance"))
            }
            Err(err) => halt(state, self.name(), BuildError::Provision(format!("{:#}", err))),
        }
    }
}
