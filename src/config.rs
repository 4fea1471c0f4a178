//! Build configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TENCENTCLOUD_SECRET_ID, TENCENTCLOUD_SECRET_KEY,
//!    TENCENTCLOUD_REGION)
//! 2. Config file (`--config` or the nearest `cvmbake.yaml`)
//! 3. Defaults
//!
//! Config file discovery searches the current directory and its parents.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::poll::PollPolicy;
use crate::error::BuildError;

pub const CONFIG_FILE_NAME: &str = "cvmbake.yaml";

pub const ENV_SECRET_ID: &str = "TENCENTCLOUD_SECRET_ID";
pub const ENV_SECRET_KEY: &str = "TENCENTCLOUD_SECRET_KEY";
pub const ENV_REGION: &str = "TENCENTCLOUD_REGION";

/// Smallest system disk the control plane accepts
pub const MIN_DISK_SIZE_GB: u32 = 20;

/// Regions accepted without `skip_region_validation`
pub const KNOWN_REGIONS: &[&str] = &[
    "ap-bangkok",
    "ap-beijing",
    "ap-chengdu",
    "ap-chongqing",
    "ap-guangzhou",
    "ap-hongkong",
    "ap-jakarta",
    "ap-mumbai",
    "ap-nanjing",
    "ap-seoul",
    "ap-shanghai",
    "ap-shanghai-fsi",
    "ap-shenzhen-fsi",
    "ap-singapore",
    "ap-tokyo",
    "eu-frankfurt",
    "na-ashburn",
    "na-siliconvalley",
    "na-toronto",
    "sa-saopaulo",
];

/// Complete build parameters (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub polling: PollingConfig,

    /// Do not check region names against the known list
    #[serde(default)]
    pub skip_region_validation: bool,
}

/// Credentials and target region
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessConfig {
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub region: String,
}

impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .finish()
    }
}

/// What to do with the baked image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub image_description: String,

    /// Run everything except image creation
    #[serde(default)]
    pub skip_create_image: bool,

    /// Regions to propagate the image to
    #[serde(default)]
    pub image_copy_regions: Vec<String>,

    /// Accounts the image is shared with
    #[serde(default)]
    pub image_share_accounts: Vec<String>,
}

/// Build instance and its network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub source_image_id: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_disk_type")]
    pub disk_type: String,
    #[serde(default = "default_disk_size")]
    pub disk_size: u32,

    /// Reuse this VPC instead of creating one
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default = "default_vpc_name")]
    pub vpc_name: String,
    #[serde(default = "default_cidr_block")]
    pub cidr_block: String,

    /// Reuse this subnet instead of creating one (requires `vpc_id`)
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default = "default_subnet_name")]
    pub subnet_name: String,
    #[serde(default = "default_subnet_cidr_block")]
    pub subnet_cidr_block: String,

    /// Reuse this security group instead of creating one
    #[serde(default)]
    pub security_group_id: Option<String>,
    #[serde(default = "default_security_group_name")]
    pub security_group_name: String,

    /// Reuse this key pair instead of creating a temporary one
    #[serde(default)]
    pub ssh_key_id: Option<String>,

    /// Write the temporary private key here (debug builds)
    #[serde(default)]
    pub debug_key_path: Option<PathBuf>,

    #[serde(default)]
    pub associate_public_ip_address: bool,
    #[serde(default = "default_bandwidth")]
    pub internet_max_bandwidth_out: u32,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub run_tags: BTreeMap<String, String>,
}

fn default_instance_name() -> String {
    "cvmbake-instance".to_string()
}
fn default_disk_type() -> String {
    "CLOUD_PREMIUM".to_string()
}
fn default_disk_size() -> u32 {
    50
}
fn default_vpc_name() -> String {
    "cvmbake-vpc".to_string()
}
fn default_cidr_block() -> String {
    "10.0.0.0/16".to_string()
}
fn default_subnet_name() -> String {
    "cvmbake-subnet".to_string()
}
fn default_subnet_cidr_block() -> String {
    "10.0.8.0/24".to_string()
}
fn default_security_group_name() -> String {
    "cvmbake-sg".to_string()
}
fn default_bandwidth() -> u32 {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_image_id: String::new(),
            instance_type: String::new(),
            zone: String::new(),
            instance_name: default_instance_name(),
            disk_type: default_disk_type(),
            disk_size: default_disk_size(),
            vpc_id: None,
            vpc_name: default_vpc_name(),
            cidr_block: default_cidr_block(),
            subnet_id: None,
            subnet_name: default_subnet_name(),
            subnet_cidr_block: default_subnet_cidr_block(),
            security_group_id: None,
            security_group_name: default_security_group_name(),
            ssh_key_id: None,
            debug_key_path: None,
            associate_public_ip_address: false,
            internet_max_bandwidth_out: default_bandwidth(),
            user_data: None,
            run_tags: BTreeMap::new(),
        }
    }
}

/// Provisioning commands run against the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
}

fn default_command_timeout() -> u64 {
    600
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            command_timeout_seconds: default_command_timeout(),
        }
    }
}

/// Wait budgets for asynchronous remote transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_instance_poll")]
    pub instance: PollPolicy,
    #[serde(default = "default_image_poll")]
    pub image: PollPolicy,
    #[serde(default = "default_image_poll")]
    pub copy: PollPolicy,
}

fn default_instance_poll() -> PollPolicy {
    PollPolicy::default()
}
fn default_image_poll() -> PollPolicy {
    PollPolicy::default().with_timeout_seconds(3600)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            instance: default_instance_poll(),
            image: default_image_poll(),
            copy: default_image_poll(),
        }
    }
}

impl BuildConfig {
    /// Load from an explicit path, or discover `cvmbake.yaml`
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => find_config_file().with_context(|| {
                format!(
                    "No {} found in the current directory or its parents",
                    CONFIG_FILE_NAME
                )
            })?,
        };

        let mut config = Self::from_file(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok((config, path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse build configuration YAML")
    }

    /// Overlay environment values (lookup is injectable for tests)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret_id) = lookup(ENV_SECRET_ID) {
            self.access.secret_id = Some(secret_id);
        }
        if let Some(secret_key) = lookup(ENV_SECRET_KEY) {
            self.access.secret_key = Some(secret_key);
        }
        if let Some(region) = lookup(ENV_REGION) {
            self.access.region = region;
        }
    }

    /// Check every option, collecting all problems
    pub fn validate(&self) -> Result<(), BuildError> {
        let mut problems = Vec::new();
        let run = &self.run;
        let image = &self.image;

        if self.access.region.is_empty() {
            problems.push("region is required".to_string());
        } else if !self.skip_region_validation && !is_known_region(&self.access.region) {
            problems.push(format!("unknown region '{}'", self.access.region));
        }

        for (name, value) in [
            ("zone", &run.zone),
            ("instance_type", &run.instance_type),
            ("source_image_id", &run.source_image_id),
        ] {
            if value.is_empty() {
                problems.push(format!("{} is required", name));
            }
        }

        if !image.skip_create_image && image.image_name.is_empty() {
            problems.push("image_name is required unless skip_create_image is set".to_string());
        }

        let mut seen = HashSet::new();
        for region in &image.image_copy_regions {
            if *region == self.access.region {
                problems.push(format!(
                    "image_copy_regions must not include the build region '{}'",
                    region
                ));
            } else if !seen.insert(region.as_str()) {
                problems.push(format!("image_copy_regions lists '{}' twice", region));
            } else if !self.skip_region_validation && !is_known_region(region) {
                problems.push(format!("unknown copy region '{}'", region));
            }
        }

        if run.subnet_id.is_some() && run.vpc_id.is_none() {
            problems.push("subnet_id requires vpc_id".to_string());
        }
        if run.vpc_id.is_none() && !is_valid_cidr(&run.cidr_block) {
            problems.push(format!("invalid cidr_block '{}'", run.cidr_block));
        }
        if run.subnet_id.is_none() && !is_valid_cidr(&run.subnet_cidr_block) {
            problems.push(format!("invalid subnet_cidr_block '{}'", run.subnet_cidr_block));
        }

        if run.disk_size < MIN_DISK_SIZE_GB {
            problems.push(format!(
                "disk_size must be at least {} GB, got {}",
                MIN_DISK_SIZE_GB, run.disk_size
            ));
        }
        if run.ssh_key_id.is_some() && run.debug_key_path.is_some() {
            problems.push("ssh_key_id and debug_key_path are mutually exclusive".to_string());
        }

        for (name, policy) in [
            ("instance", &self.polling.instance),
            ("image", &self.polling.image),
            ("copy", &self.polling.copy),
        ] {
            if policy.interval_ms == 0 || policy.timeout_seconds == 0 {
                problems.push(format!(
                    "polling.{} needs a non-zero interval and timeout",
                    name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Validation(problems))
        }
    }
}

fn is_known_region(region: &str) -> bool {
    KNOWN_REGIONS.contains(&region)
}

/// `a.b.c.d/n` with n <= 32
fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

/// Find the config file by searching the current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let current = std::env::current_dir().ok()?;
    find_config_file_from(&current)
}

fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}
