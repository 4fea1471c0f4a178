//! Build Integration Tests
//!
//! End-to-end builds against the simulated control plane: what is left
//! behind, what is cleaned up, and what the caller gets back.

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use cvmbake::adapters::{CommandProvisioner, NoopProvisioner, Provisioner, SimulatedCloud};
use cvmbake::config::BuildConfig;
use cvmbake::core::{BuildOutcome, ImageBuilder};
use cvmbake::domain::{RunState, StepStatus};
use cvmbake::error::BuildError;

const REGION: &str = "ap-guangzhou";

const BASE_YAML: &str = r#"
access:
  region: ap-guangzhou
image:
  image_name: web-base
run:
  source_image_id: img-src
  instance_type: S5.MEDIUM2
  zone: ap-guangzhou-3
polling:
  instance:
    interval_ms: 1000
    timeout_seconds: 60
  image:
    interval_ms: 1000
    timeout_seconds: 60
  copy:
    interval_ms: 1000
    timeout_seconds: 60
"#;

fn config() -> BuildConfig {
    BuildConfig::from_yaml(BASE_YAML).unwrap()
}

fn cloud() -> SimulatedCloud {
    SimulatedCloud::new(REGION).with_image("img-src", "centos-base")
}

fn builder(config: BuildConfig, cloud: &Arc<SimulatedCloud>) -> ImageBuilder {
    builder_with(config, cloud, Arc::new(NoopProvisioner))
}

fn builder_with(
    config: BuildConfig,
    cloud: &Arc<SimulatedCloud>,
    provisioner: Arc<dyn Provisioner>,
) -> ImageBuilder {
    ImageBuilder::new(config, cloud.clone(), provisioner)
}

/// No temporary infrastructure survives the build
fn assert_no_leftovers(cloud: &SimulatedCloud) {
    assert_eq!(cloud.instance_count(), 0, "instances left behind");
    assert_eq!(cloud.security_group_count(), 0, "security groups left behind");
    assert_eq!(cloud.subnet_count(), 0, "subnets left behind");
    assert_eq!(cloud.vpc_count(), 0, "vpcs left behind");
    assert_eq!(cloud.key_pair_count(), 0, "key pairs left behind");
}

#[tokio::test(start_paused = true)]
async fn test_successful_build_with_copies_and_sharing() {
    let cloud = Arc::new(cloud());
    let mut config = config();
    config.image.image_copy_regions = vec!["ap-shanghai".into(), "ap-tokyo".into()];
    config.image.image_share_accounts = vec!["100001".into()];

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    let summary = report.summary.unwrap();
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.steps.len(), 12);
    assert!(summary.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(summary.cleanup_order.first().map(String::as_str), Some("copy_image"));
    assert_eq!(summary.cleanup_order.last().map(String::as_str), Some("pre_validate"));

    let BuildOutcome::Built(artifact) = report.outcome else {
        panic!("expected a built image");
    };
    assert_eq!(artifact.images.len(), 3);
    let image_id = artifact.image_in(REGION).unwrap().to_string();
    assert_eq!(cloud.shared_accounts(&image_id), vec!["100001"]);
    assert_eq!(cloud.images_in("ap-tokyo").len(), 1);
    assert_eq!(artifact.generated_data["SourceImageId"], "img-src");
    assert_eq!(artifact.generated_data["ImageName"], "web-base");
    assert_no_leftovers(&cloud);

    let manifest = artifact.manifest();
    assert_eq!(manifest.artifact_id, artifact.id());

    assert_ok!(artifact.destroy().await);
    assert_eq!(cloud.images_in(REGION).len(), 1);
    assert!(cloud.images_in("ap-tokyo").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_skipped_image_creation_is_not_an_error() {
    let cloud = Arc::new(cloud());
    let mut config = config();
    config.image.skip_create_image = true;
    config.image.image_name.clear();

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    assert!(matches!(report.outcome, BuildOutcome::Skipped));
    assert!(report.outcome.is_success());
    assert_eq!(cloud.call_count("CreateImage"), 0);
    assert_no_leftovers(&cloud);
}

#[tokio::test(start_paused = true)]
async fn test_name_collision_creates_nothing() {
    let cloud = Arc::new(cloud().with_image("img-old", "web-base"));

    let report = builder(config(), &cloud).run(&CancellationToken::new()).await;

    let (artifact, error) = report.outcome.into_parts();
    assert!(artifact.is_none());
    assert!(matches!(error, Some(BuildError::Precondition(_))));
    assert!(!cloud.created_anything());
    assert_eq!(
        report.summary.unwrap().state,
        RunState::Halted {
            step: "pre_validate".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_source_image_fails_early() {
    let cloud = Arc::new(SimulatedCloud::new(REGION));

    let report = builder(config(), &cloud).run(&CancellationToken::new()).await;

    assert!(!report.outcome.is_success());
    assert!(!cloud.created_anything());
}

#[tokio::test(start_paused = true)]
async fn test_partial_propagation_returns_artifact_and_error() {
    let cloud = Arc::new(cloud().fail_copy_to("ap-tokyo"));
    let mut config = config();
    config.image.image_copy_regions = vec![
        "ap-shanghai".into(),
        "ap-tokyo".into(),
        "ap-singapore".into(),
    ];

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    assert!(!report.outcome.is_success());
    let (artifact, error) = report.outcome.into_parts();
    let artifact = artifact.unwrap();
    let error = error.unwrap();

    assert!(error.is_partial_propagation());
    assert_eq!(error.failed_regions(), vec!["ap-tokyo"]);
    assert_eq!(artifact.images.len(), 3);
    assert!(artifact.image_in("ap-shanghai").is_some());
    assert!(artifact.image_in("ap-singapore").is_some());
    assert!(artifact.image_in("ap-tokyo").is_none());

    // The successful images are kept, the temporary resources are not
    assert_eq!(cloud.images_in(REGION).len(), 2);
    assert_eq!(cloud.images_in("ap-shanghai").len(), 1);
    assert_eq!(cloud.images_in("ap-singapore").len(), 1);
    assert_no_leftovers(&cloud);
}

#[tokio::test(start_paused = true)]
async fn test_copy_failing_after_acceptance_leaves_nothing_behind() {
    let cloud = Arc::new(cloud().break_copies_in("ap-tokyo"));
    let mut config = config();
    config.image.image_copy_regions = vec!["ap-shanghai".into(), "ap-tokyo".into()];

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    let (artifact, error) = report.outcome.into_parts();
    let artifact = artifact.unwrap();
    assert_eq!(error.unwrap().failed_regions(), vec!["ap-tokyo"]);
    assert!(artifact.image_in("ap-tokyo").is_none());
    assert!(cloud.images_in("ap-tokyo").is_empty());
    assert_no_leftovers(&cloud);

    assert_ok!(artifact.destroy().await);
    assert_eq!(cloud.images_in(REGION).len(), 1);
    assert!(cloud.images_in("ap-shanghai").is_empty());
    assert!(cloud.images_in("ap-tokyo").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_while_waiting_for_instance() {
    let cloud = Arc::new(cloud().with_stalled_instances());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let report = builder(config(), &cloud).run(&cancel).await;

    let (artifact, error) = report.outcome.into_parts();
    assert!(artifact.is_none());
    assert!(error.unwrap().is_cancelled());
    assert_eq!(cloud.call_count("TerminateInstances"), 1);
    assert_eq!(cloud.call_count("CreateImage"), 0);
    assert_no_leftovers(&cloud);
}

#[tokio::test(start_paused = true)]
async fn test_instance_timeout_cleans_up() {
    let cloud = Arc::new(cloud().with_stalled_instances());
    let mut config = config();
    config.polling.instance.timeout_seconds = 10;

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        BuildOutcome::Failed(BuildError::Timeout { .. })
    ));
    assert_no_leftovers(&cloud);
}

#[tokio::test(start_paused = true)]
async fn test_failure_after_image_deletes_image() {
    let cloud = Arc::new(cloud().fail_on("ModifyImageSharePermission"));
    let mut config = config();
    config.image.image_share_accounts = vec!["100001".into()];

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    assert!(matches!(
        report.outcome,
        BuildOutcome::Failed(BuildError::Remote { .. })
    ));
    assert_eq!(cloud.call_count("CreateImage"), 1);
    assert_eq!(cloud.images_in(REGION), vec![("img-src".to_string(), "centos-base".to_string())]);
    assert_no_leftovers(&cloud);
}

#[tokio::test(start_paused = true)]
async fn test_user_supplied_resources_are_kept() {
    let cloud = Arc::new(
        cloud()
            .with_vpc("vpc-mine", "172.16.0.0/16")
            .with_subnet("subnet-mine", "vpc-mine", "ap-guangzhou-3")
            .with_security_group("sg-mine")
            .with_key_pair("skey-mine"),
    );
    let mut config = config();
    config.run.vpc_id = Some("vpc-mine".into());
    config.run.subnet_id = Some("subnet-mine".into());
    config.run.security_group_id = Some("sg-mine".into());
    config.run.ssh_key_id = Some("skey-mine".into());

    let report = builder(config, &cloud).run(&CancellationToken::new()).await;

    assert!(report.outcome.is_success());
    assert_eq!(cloud.vpc_count(), 1);
    assert_eq!(cloud.subnet_count(), 1);
    assert_eq!(cloud.security_group_count(), 1);
    assert_eq!(cloud.key_pair_count(), 1);
    assert_eq!(cloud.instance_count(), 0);
    for op in ["CreateVpc", "CreateSubnet", "CreateSecurityGroup", "CreateKeyPair"] {
        assert_eq!(cloud.call_count(op), 0, "{} was called", op);
    }
    assert_eq!(cloud.call_count("DisassociateInstancesKeyPairs"), 0);
}

#[tokio::test]
async fn test_provisioning_failure_fails_build() {
    let cloud = Arc::new(cloud());
    let mut config = config();
    config.polling.instance.interval_ms = 10;
    let provisioner = Arc::new(CommandProvisioner::new(
        vec!["test -n \"$CVMBAKE_INSTANCE_ADDRESS\"".into(), "exit 3".into()],
        Duration::from_secs(30),
    ));

    let report = builder_with(config, &cloud, provisioner)
        .run(&CancellationToken::new())
        .await;

    let Some(BuildError::Provision(message)) = report.outcome.error() else {
        panic!("expected a provisioning error, got {:?}", report.outcome);
    };
    assert!(message.contains("exit 3"));
    assert_eq!(cloud.call_count("CreateImage"), 0);
    assert_no_leftovers(&cloud);
}
