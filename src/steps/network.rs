//! Network resources for the build instance: VPC, subnet, security group.
//!
//! Each step either reuses a caller-supplied id (validated, never deleted)
//! or creates a resource, records its id, and deletes exactly that id in
//! cleanup.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::adapters::CloudClient;
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepConfigVpc {
    client: Arc<dyn CloudClient>,
    vpc_id: Option<String>,
    name: String,
    cidr_block: String,
    created_vpc_id: Option<String>,
}

impl StepConfigVpc {
    pub fn new(client: Arc<dyn CloudClient>, vpc_id: Option<String>, name: impl Into<String>, cidr_block: impl Into<String>) -> Self {
        Self {
            client,
            vpc_id,
            name: name.into(),
            cidr_block: cidr_block.into(),
            created_vpc_id: None,
        }
    }

    async fn acquire(&mut self, state: &mut StateBag) -> Result<(), BuildError> {
        if let Some(vpc_id) = &self.vpc_id {
            info!(%vpc_id, "Using existing VPC");
            self.client
                .describe_vpc(vpc_id)
                .await
                .map_err(|err| BuildError::remote("failed to describe vpc", err))?
                .ok_or_else(|| BuildError::Precondition(format!("vpc '{}' not found", vpc_id)))?;
            state.put_id(StateKey::VpcId, vpc_id.clone());
            return Ok(());
        }

        info!(name = %self.name, cidr_block = %self.cidr_block, "Creating VPC");
        let vpc_id = self
            .client
            .create_vpc(&self.name, &self.cidr_block)
            .await
            .map_err(|err| BuildError::remote("failed to create vpc", err))?;
        self.created_vpc_id = Some(vpc_id.clone());
        state.put_id(StateKey::VpcId, vpc_id);
        Ok(())
    }
}

#[async_trait]
impl Step for StepConfigVpc {
    fn name(&self) -> &'static str {
        "config_vpc"
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::VpcId]
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        match self.acquire(state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        let Some(vpc_id) = self.created_vpc_id.take() else {
            return Ok(());
        };
        info!(%vpc_id, "Deleting VPC");
        self.client
            .delete_vpc(&vpc_id)
            .await
            .with_context(|| format!("Failed to delete vpc {}", vpc_id))
    }
}

pub struct StepConfigSubnet {
    client: Arc<dyn CloudClient>,
    subnet_id: Option<String>,
    name: String,
    cidr_block: String,
    zone: String,
    created_subnet_id: Option<String>,
}

impl StepConfigSubnet {
    pub fn new(
        client: Arc<dyn CloudClient>,
        subnet_id: Option<String>,
        name: impl Into<String>,
        cidr_block: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            client,
            subnet_id,
            name: name.into(),
            cidr_block: cidr_block.into(),
            zone: zone.into(),
            created_subnet_id: None,
        }
    }

    async fn acquire(&mut self, state: &mut StateBag) -> Result<(), BuildError> {
        let vpc_id = state.require_id("config_subnet", StateKey::VpcId)?;

        if let Some(subnet_id) = &self.subnet_id {
            info!(%subnet_id, "Using existing subnet");
            let subnet = self
                .client
                .describe_subnet(subnet_id)
                .await
                .map_err(|err| BuildError::remote("failed to describe subnet", err))?
                .ok_or_else(|| BuildError::Precondition(format!("subnet '{}' not found", subnet_id)))?;

            if subnet.vpc_id != vpc_id {
                return Err(BuildError::Precondition(format!(
                    "subnet '{}' belongs to vpc '{}', not '{}'",
                    subnet_id, subnet.vpc_id, vpc_id
                )));
            }
            if subnet.zone != self.zone {
                return Err(BuildError::Precondition(format!(
                    "subnet '{}' is in zone '{}', not '{}'",
                    subnet_id, subnet.zone, self.zone
                )));
            }
            state.put_id(StateKey::SubnetId, subnet_id.clone());
            return Ok(());
        }

        info!(name = %self.name, cidr_block = %self.cidr_block, zone = %self.zone, "Creating subnet");
        let subnet_id = self
            .client
            .create_subnet(&vpc_id, &self.name, &self.cidr_block, &self.zone)
            .await
            .map_err(|err| BuildError::remote("failed to create subnet", err))?;
        self.created_subnet_id = Some(subnet_id.clone());
        state.put_id(StateKey::SubnetId, subnet_id);
        Ok(())
    }
}

#[async_trait]
impl Step for StepConfigSubnet {
    fn name(&self) -> &'static str {
        "config_subnet"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::VpcId]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::SubnetId]
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        match self.acquire(state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        let Some(subnet_id) = self.created_subnet_id.take() else {
            return Ok(());
        };
        info!(%subnet_id, "Deleting subnet");
        self.client
            .delete_subnet(&subnet_id)
            .await
            .with_context(|| format!("Failed to delete subnet {}", subnet_id))
    }
}

pub struct StepConfigSecurityGroup {
    client: Arc<dyn CloudClient>,
    group_id: Option<String>,
    name: String,
    description: String,
    created_group_id: Option<String>,
}

impl StepConfigSecurityGroup {
    pub fn new(client: Arc<dyn CloudClient>, group_id: Option<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            group_id,
            name: name.into(),
            description: "security group for cvmbake".to_string(),
            created_group_id: None,
        }
    }

    #[instrument(skip_all, fields(name = %self.name))]
    async fn acquire(&mut self, state: &mut StateBag) -> Result<(), BuildError> {
        if let Some(group_id) = &self.group_id {
            info!(%group_id, "Using existing security group");
            self.client
                .describe_security_group(group_id)
                .await
                .map_err(|err| BuildError::remote("failed to describe security group", err))?
                .ok_or_else(|| {
                    BuildError::Precondition(format!("security group '{}' not found", group_id))
                })?;
            state.put_id(StateKey::SecurityGroupId, group_id.clone());
            return Ok(());
        }

        info!("Creating security group");
        let group_id = self
            .client
            .create_security_group(&self.name, &self.description)
            .await
            .map_err(|err| BuildError::remote("failed to create security group", err))?;
        // Recorded before the rule so cleanup covers a failed rule
        self.created_group_id = Some(group_id.clone());
        state.put_id(StateKey::SecurityGroupId, group_id.clone());

        self.client
            .allow_ingress(&group_id, "ALL", "0.0.0.0/0")
            .await
            .map_err(|err| BuildError::remote("failed to add security group ingress rule", err))
    }
}

#[async_trait]
impl Step for StepConfigSecurityGroup {
    fn name(&self) -> &'static str {
        "config_security_group"
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::SecurityGroupId]
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        match self.acquire(state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, _state: &mut StateBag) -> anyhow::Result<()> {
        let Some(group_id) = self.created_group_id.take() else {
            return Ok(());
        };
        info!(%group_id, "Deleting security group");
        self.client
            .delete_security_group(&group_id)
            .await
            .with_context(|| format!("Failed to delete security group {}", group_id))
    }
}
