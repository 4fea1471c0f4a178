//! Bakes the image from the provisioned instance.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::adapters::{CloudClient, Image, ImageState};
use crate::core::poll::{wait_for, PollPolicy, Probe};
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::{BuildError, CloudError};

/// Poll until `image_id` in `region` is ready to use
pub(crate) async fn wait_for_image(
    client: &Arc<dyn CloudClient>,
    cancel: &CancellationToken,
    policy: &PollPolicy,
    region: &str,
    image_id: &str,
) -> Result<Image, BuildError> {
    let what = format!("image {} in {}", image_id, region);
    wait_for(cancel, policy, &what, || {
        let client = client.clone();
        let region = region.to_string();
        let image_id = image_id.to_string();
        async move {
            Ok::<_, CloudError>(match client.describe_image(&region, &image_id).await? {
                None => Probe::Pending,
                Some(image) => match image.state {
                    ImageState::Ready => Probe::Ready(image),
                    ImageState::Failed => Probe::Failed("CREATE_FAILED".to_string()),
                    ImageState::Creating => Probe::Pending,
                },
            })
        }
    })
    .await
}

pub struct StepCreateImage {
    client: Arc<dyn CloudClient>,
    image_name: String,
    image_description: String,
    skip: bool,
    poll: PollPolicy,
    image_id: Option<String>,
}

impl StepCreateImage {
    pub fn new(
        client: Arc<dyn CloudClient>,
        image_name: impl Into<String>,
        image_description: impl Into<String>,
        skip: bool,
        poll: PollPolicy,
    ) -> Self {
        Self {
            client,
            image_name: image_name.into(),
            image_description: image_description.into(),
            skip,
            poll,
            image_id: None,
        }
    }

    #[instrument(skip_all, fields(image_name = %self.image_name))]
    async fn bake(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> Result<(), BuildError> {
        let instance_id = state.require_id(self.name(), StateKey::InstanceId)?;

        info!(%instance_id, "Creating image");
        let image_id = self
            .client
            .create_image(&instance_id, &self.image_name, &self.image_description)
            .await
            .map_err(|err| BuildError::remote("failed to create image", err))?;
        self.image_id = Some(image_id.clone());

        info!(%image_id, "Waiting for image to become ready");
        let region = self.client.region().to_string();
        wait_for_image(&self.client, cancel, &self.poll, &region, &image_id).await?;

        info!(%image_id, "Image created");
        state.put_id(StateKey::ImageId, image_id.clone());
        state.insert_image(region, image_id);
        state.insert_generated("ImageName", self.image_name.clone());
        Ok(())
    }
}

#[async_trait]
impl Step for StepCreateImage {
    fn name(&self) -> &'static str {
        "create_image"
    }

    fn reads(&self) -> &'static [StateKey] {
        &[StateKey::InstanceId]
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::ImageId, StateKey::Images, StateKey::GeneratedData]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        if self.skip {
            info!("Skipping image creation");
            return StepAction::Continue;
        }

        match self.bake(cancel, state).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, state: &mut StateBag) -> anyhow::Result<()> {
        if !state.is_failed_build() {
            return Ok(());
        }
        let Some(image_id) = self.image_id.take() else {
            return Ok(());
        };

        info!(%image_id, "Deleting image from failed build");
        self.client
            .delete_image(self.client.region(), &image_id)
            .await
            .with_context(|| format!("Failed to delete image {}", image_id))
    }
}
