//! Launches the build instance and waits for it to run.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::adapters::{CloudClient, Instance, InstanceSpec, InstanceState};
use crate::core::poll::{wait_for, PollPolicy, Probe};
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::{BuildError, CloudError};

/// Poll until `instance_id` reports `Running`
pub(crate) async fn wait_for_running(
    client: &Arc<dyn CloudClient>,
    cancel: &CancellationToken,
    policy: &PollPolicy,
    instance_id: &str,
) -> Result<Instance, BuildError> {
    let what = format!("instance {} to be running", instance_id);
    wait_for(cancel, policy, &what, || {
        let client = client.clone();
        let instance_id = instance_id.to_string();
        async move {
            Ok::<_, CloudError>(match client.describe_instance(&instance_id).await? {
                // Not visible yet
                None => Probe::Pending,
                Some(instance) => match instance.state {
                    InstanceState::Running => Probe::Ready(instance),
                    InstanceState::LaunchFailed => Probe::Failed("LAUNCH_FAILED".to_string()),
                    _ => Probe::Pending,
                },
            })
        }
    })
    .await
}

pub struct StepRunInstance {
    client: Arc<dyn CloudClient>,
    spec: InstanceSpec,
    poll: PollPolicy,
    instance_id: Option<String>,
}

impl StepRunInstance {
    /// `spec` carries the launch parameters; network and key ids are filled
    /// in from state
    pub fn new(client: Arc<dyn CloudClient>, spec: InstanceSpec, poll: PollPolicy) -> Self {
        Self {
            client,
            spec,
            poll,
            instance_id: None,
        }
    }

    #[instrument(skip_all, fields(instance_type = %self.spec.instance_type))]
    async fn launch(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let mut spec = self.spec.clone();
        spec.vpc_id = state.require_id(self.name(), StateKey::VpcId)?;
        spec.subnet_id = state.require_id(self.name(), StateKey::SubnetId)?;
        spec.security_group_id = state.require_id(self.name(), StateKey::SecurityGroupId)?;
        spec.key_pair_id = state.key_pair().map(|key| key.id.clone());

        info!("Creating instance");
        let instance_id = self
            .client
            .run_instance(&spec)
            .await
            .map_err(|err| BuildError::remote("failed to run instance", err))?;

        // Recorded before waiting so cleanup can terminate on timeout or cancel
        self.instance_id = Some(instance_id.clone());
        state.put_id(StateKey::InstanceId, instance_id.clone());
        info!(%instance_id, "Waiting for instance to become running");

        let instance = wait_for_running(&self.client, cancel, &self.poll, &instance_id).await?;

        let address = if spec.associate_public_ip {
            instance.public_ip
        } else {
            instance.private_ip
        }
        .ok_or_else(|| {
            BuildError::Precondition(format!("instance {} has no reachable address", instance_id))
        })?;

        info!(%instance_id, %address, "Instance is running");
        state.put_id(StateKey::InstanceAddress, address);
        state.insert_generated("InstanceType", spec.instance_type.clone());
        state.insert_generated("Zone", spec.zone.clone());
        Ok(())
    }
}

#[async_trait]
impl Step for StepRunInstance {
    fn name(&self) -> &'static str {
        "run_instance"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[
            StateKey::KeyPair,
            StateKey::VpcId,
            StateKey::SubnetId,
            StateKey::SecurityGroupId,
        ]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[
            StateKey::InstanceId,
            StateKey::InstanceAddress,
            StateKey::GeneratedData,
        ]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        match self.launch(cancel, state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        let Some(instance_id) = self.instance_id.take() else {
            return Ok(());
        };

        info!(%instance_id, "Terminating instance");
        self.client
            .terminate_instance(&instance_id)
            .await
            .with_context(|| format!("Failed to terminate instance {}", instance_id))?;

        // Network resources cannot be deleted until the instance is gone.
        // Cleanup runs even after cancellation, so it gets its own token.
        let what = format!("instance {} to terminate", instance_id);
        let client = self.client.clone();
        wait_for(&CancellationToken::new(), &self.poll, &what, || {
            let client = client.clone();
            let instance_id = instance_id.clone();
            async move {
                Ok::<_, CloudError>(match client.describe_instance(&instance_id).await? {
                    None => Probe::Ready(()),
                    Some(_) => Probe::Pending,
                })
            }
        })
        .await
        .map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;
    use std::time::Duration;

    fn cloud() -> SimulatedCloud {
        SimulatedCloud::new("ap-guangzhou")
            .with_image("img-src", "centos")
            .with_vpc("vpc-1", "10.0.0.0/16")
            .with_subnet("subnet-1", "vpc-1", "ap-guangzhou-3")
            .with_security_group("sg-1")
    }

    fn state() -> StateBag {
        let mut state = StateBag::new();
        state.put_id(StateKey::VpcId, "vpc-1");
        state.put_id(StateKey::SubnetId, "subnet-1");
        state.put_id(StateKey::SecurityGroupId, "sg-1");
        state
    }

    fn spec(public: bool) -> InstanceSpec {
        InstanceSpec {
            name: "builder".into(),
            instance_type: "S5.MEDIUM2".into(),
            image_id: "img-src".into(),
            zone: "ap-guangzhou-3".into(),
            associate_public_ip: public,
            ..Default::default()
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_runs_and_records_address() {
        let cloud = Arc::new(cloud().with_ready_after(2));
        let mut step = StepRunInstance::new(cloud.clone(), spec(true), policy());
        let mut state = state();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert!(state.id(StateKey::InstanceId).is_some());
        assert!(state
            .id(StateKey::InstanceAddress)
            .unwrap()
            .starts_with("203.0.113."));

        step.cleanup(&mut state).await.unwrap();
        assert_eq!(cloud.instance_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_records_instance_for_cleanup() {
        let cloud = Arc::new(cloud().with_stalled_instances());
        let mut step = StepRunInstance::new(cloud.clone(), spec(false), policy());
        let mut state = state();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        assert!(matches!(state.error(), Some(BuildError::Timeout { .. })));
        assert!(state.id(StateKey::InstanceId).is_some());
        assert_eq!(cloud.instance_count(), 1);

        step.cleanup(&mut state).await.unwrap();
        assert_eq!(cloud.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_network_is_contract_violation() {
        let cloud = Arc::new(cloud());
        let mut step = StepRunInstance::new(cloud.clone(), spec(false), policy());
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        assert!(matches!(state.error(), Some(BuildError::MissingState { .. })));
        assert_eq!(cloud.call_count("RunInstances"), 0);
    }
}
