//! Adapter interfaces for external systems.
//!
//! Adapters give the build steps a uniform view of the two collaborators
//! they drive: the remote control plane (`CloudClient`) and the provisioning
//! action run inside the new instance (`Provisioner`).

pub mod command;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CloudError;

pub use command::{CommandProvisioner, NoopProvisioner};
pub use simulated::SimulatedCloud;

/// Result type for control-plane verbs
pub type CloudResult<T> = Result<T, CloudError>;

/// Lifecycle of an image as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Creating,
    Ready,
    Failed,
}

/// An image visible in one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub region: String,
    pub state: ImageState,
}

/// Lifecycle of an instance as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    LaunchFailed,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vpc {
    pub id: String,
    pub name: String,
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub zone: String,
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

/// Key pair attached to the build instance.
///
/// `temporary` pairs were created by this build and are deleted by it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub id: String,
    pub name: String,
    pub private_key: Option<String>,
    pub temporary: bool,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("temporary", &self.temporary)
            .finish()
    }
}

/// Parameters for launching the build instance
#[derive(Debug, Clone, Default)]
pub struct InstanceSpec {
    pub name: String,
    pub instance_type: String,
    pub image_id: String,
    pub zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub key_pair_id: Option<String>,
    pub disk_type: String,
    pub disk_size_gb: u32,
    pub associate_public_ip: bool,
    pub internet_max_bandwidth_out: u32,
    pub user_data: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// The remote control plane.
///
/// Every call is request/response; state transitions such as "instance is
/// running" are asynchronous and must be observed with `describe_*` calls.
/// `describe_*` returns `Ok(None)` for an id the control plane does not know.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Region this client issues requests against
    fn region(&self) -> &str;

    async fn find_image_by_name(&self, name: &str) -> CloudResult<Option<Image>>;
    async fn describe_image(&self, region: &str, image_id: &str) -> CloudResult<Option<Image>>;
    async fn create_image(&self, instance_id: &str, name: &str, description: &str) -> CloudResult<String>;
    /// Starts copying an image; returns the id of the copy in `region`
    async fn copy_image(&self, image_id: &str, region: &str) -> CloudResult<String>;
    async fn share_image(&self, image_id: &str, accounts: &[String]) -> CloudResult<()>;
    async fn unshare_image(&self, image_id: &str, accounts: &[String]) -> CloudResult<()>;
    async fn delete_image(&self, region: &str, image_id: &str) -> CloudResult<()>;

    async fn create_key_pair(&self, name: &str) -> CloudResult<KeyPair>;
    async fn describe_key_pair(&self, key_id: &str) -> CloudResult<Option<KeyPair>>;
    async fn detach_key_pair(&self, instance_id: &str, key_id: &str) -> CloudResult<()>;
    async fn delete_key_pair(&self, key_id: &str) -> CloudResult<()>;

    async fn create_vpc(&self, name: &str, cidr_block: &str) -> CloudResult<String>;
    async fn describe_vpc(&self, vpc_id: &str) -> CloudResult<Option<Vpc>>;
    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()>;

    async fn create_subnet(&self, vpc_id: &str, name: &str, cidr_block: &str, zone: &str) -> CloudResult<String>;
    async fn describe_subnet(&self, subnet_id: &str) -> CloudResult<Option<Subnet>>;
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    async fn create_security_group(&self, name: &str, description: &str) -> CloudResult<String>;
    async fn describe_security_group(&self, group_id: &str) -> CloudResult<Option<SecurityGroup>>;
    async fn allow_ingress(&self, group_id: &str, protocol: &str, cidr_block: &str) -> CloudResult<()>;
    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;

    async fn run_instance(&self, spec: &InstanceSpec) -> CloudResult<String>;
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<Option<Instance>>;
    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;
}

/// Where the provisioning action should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTarget {
    pub instance_id: String,
    pub address: String,
}

/// The opaque provisioning action run once the instance is reachable
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Human-readable provisioner name
    fn name(&self) -> &str;

    async fn provision(
        &self,
        cancel: &CancellationToken,
        target: &ProvisionTarget,
    ) -> anyhow::Result<()>;
}
