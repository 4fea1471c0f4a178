//! The image builder.
//!
//! Validates the configuration, assembles the fixed step sequence, runs it
//! and turns the final state into a build outcome.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapters::{CloudClient, InstanceSpec, Provisioner};
use crate::config::BuildConfig;
use crate::domain::RunSummary;
use crate::steps::{
    StepCheckSourceImage, StepConfigKeyPair, StepConfigSecurityGroup, StepConfigSubnet,
    StepConfigVpc, StepCopyImage, StepCreateImage, StepDetachTempKeyPair, StepPreValidate,
    StepProvision, StepRunInstance, StepShareImage,
};

use super::assembler::{assemble, BuildOutcome};
use super::runner::Runner;
use super::state::StateBag;
use super::step::Step;

/// Outcome of a build plus the runner's diagnostics
#[derive(Debug)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    /// `None` when the build was rejected before any step ran
    pub summary: Option<RunSummary>,
}

/// Builds one image from a configuration
pub struct ImageBuilder {
    config: BuildConfig,
    client: Arc<dyn CloudClient>,
    provisioner: Arc<dyn Provisioner>,
}

impl ImageBuilder {
    pub fn new(
        config: BuildConfig,
        client: Arc<dyn CloudClient>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            config,
            client,
            provisioner,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn instance_spec(&self) -> InstanceSpec {
        let run = &self.config.run;
        InstanceSpec {
            name: run.instance_name.clone(),
            instance_type: run.instance_type.clone(),
            image_id: run.source_image_id.clone(),
            zone: run.zone.clone(),
            disk_type: run.disk_type.clone(),
            disk_size_gb: run.disk_size,
            associate_public_ip: run.associate_public_ip_address,
            internet_max_bandwidth_out: run.internet_max_bandwidth_out,
            user_data: run.user_data.clone(),
            tags: run.run_tags.clone(),
            ..Default::default()
        }
    }

    /// The fixed step sequence
    pub fn steps(&self) -> Vec<Box<dyn Step>> {
        let config = &self.config;
        let run = &config.run;
        let image = &config.image;
        let client = &self.client;

        vec![
            Box::new(StepPreValidate::new(
                client.clone(),
                image.image_name.clone(),
                image.skip_create_image,
            )),
            Box::new(StepCheckSourceImage::new(
                client.clone(),
                run.source_image_id.clone(),
            )),
            Box::new(StepConfigKeyPair::new(
                client.clone(),
                run.ssh_key_id.clone(),
                run.debug_key_path.clone(),
            )),
            Box::new(StepConfigVpc::new(
                client.clone(),
                run.vpc_id.clone(),
                run.vpc_name.clone(),
                run.cidr_block.clone(),
            )),
            Box::new(StepConfigSubnet::new(
                client.clone(),
                run.subnet_id.clone(),
                run.subnet_name.clone(),
                run.subnet_cidr_block.clone(),
                run.zone.clone(),
            )),
            Box::new(StepConfigSecurityGroup::new(
                client.clone(),
                run.security_group_id.clone(),
                run.security_group_name.clone(),
            )),
            Box::new(StepRunInstance::new(
                client.clone(),
                self.instance_spec(),
                config.polling.instance,
            )),
            Box::new(StepProvision::new(self.provisioner.clone())),
            Box::new(StepDetachTempKeyPair::new(
                client.clone(),
                config.polling.instance,
            )),
            Box::new(StepCreateImage::new(
                client.clone(),
                image.image_name.clone(),
                image.image_description.clone(),
                image.skip_create_image,
                config.polling.image,
            )),
            Box::new(StepShareImage::new(
                client.clone(),
                image.image_share_accounts.clone(),
            )),
            Box::new(StepCopyImage::new(
                client.clone(),
                image.image_copy_regions.clone(),
                config.polling.copy,
            )),
        ]
    }

    /// Run the build to completion, cancellation or failure.
    ///
    /// Every remote resource created along the way is released before this
    /// returns, except the images reported in the outcome.
    #[instrument(skip_all, fields(region = %self.config.access.region, image = %self.config.image.image_name))]
    pub async fn run(&self, cancel: &CancellationToken) -> BuildReport {
        if let Err(err) = self.config.validate() {
            warn!(error = %err, "Configuration rejected");
            return BuildReport {
                outcome: BuildOutcome::Failed(err),
                summary: None,
            };
        }

        let mut runner = match Runner::new(self.steps(), &[]) {
            Ok(runner) => runner,
            Err(err) => {
                return BuildReport {
                    outcome: BuildOutcome::Failed(err),
                    summary: None,
                }
            }
        };

        info!(steps = ?runner.step_names(), "Starting build");
        let mut state = StateBag::new();
        let summary = runner.run(cancel, &mut state).await;

        let outcome = assemble(state, self.client.clone());
        match &outcome {
            BuildOutcome::Built(artifact) => info!(artifact = %artifact.id(), "Build finished"),
            BuildOutcome::Partial { artifact, error } => {
                warn!(artifact = %artifact.id(), error = %error, "Build finished with missing regions")
            }
            BuildOutcome::Skipped => info!("Build finished without creating an image"),
            BuildOutcome::Failed(error) if error.is_cancelled() => warn!(error = %error, "Build cancelled"),
            BuildOutcome::Failed(error) => warn!(error = %error, "Build failed"),
        }

        BuildReport {
            outcome,
            summary: Some(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NoopProvisioner, SimulatedCloud};
    use crate::error::BuildError;

    fn config() -> BuildConfig {
        BuildConfig::from_yaml(
            r#"
access:
  region: ap-guangzhou
image:
  image_name: web-base
run:
  source_image_id: img-src
  instance_type: S5.MEDIUM2
  zone: ap-guangzhou-3
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_step_sequence_is_fixed() {
        let builder = ImageBuilder::new(
            config(),
            Arc::new(SimulatedCloud::new("ap-guangzhou")),
            Arc::new(NoopProvisioner),
        );
        let runner = Runner::new(builder.steps(), &[]).unwrap();

        assert_eq!(
            runner.step_names(),
            vec![
                "pre_validate",
                "check_source_image",
                "config_key_pair",
                "config_vpc",
                "config_subnet",
                "config_security_group",
                "run_instance",
                "provision",
                "detach_temp_key_pair",
                "create_image",
                "share_image",
                "copy_image",
            ]
        );
    }

    #[test]
    fn test_instance_spec_from_config() {
        let mut config = config();
        config.run.associate_public_ip_address = true;
        config.run.run_tags.insert("team".into(), "infra".into());
        let builder = ImageBuilder::new(
            config,
            Arc::new(SimulatedCloud::new("ap-guangzhou")),
            Arc::new(NoopProvisioner),
        );

        let spec = builder.instance_spec();
        assert_eq!(spec.image_id, "img-src");
        assert_eq!(spec.disk_size_gb, 50);
        assert!(spec.associate_public_ip);
        assert_eq!(spec.tags["team"], "infra");
        assert!(spec.vpc_id.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_makes_no_calls() {
        let mut config = config();
        config.run.zone.clear();
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let builder = ImageBuilder::new(config, cloud.clone(), Arc::new(NoopProvisioner));

        let report = builder.run(&CancellationToken::new()).await;

        assert!(matches!(report.outcome, BuildOutcome::Failed(BuildError::Validation(_))));
        assert!(report.summary.is_none());
        assert!(cloud.calls().is_empty());
    }
}
