//! Pre-flight check that the image name is still free.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::adapters::CloudClient;
use crate::core::state::StateBag;
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

/// Halts before anything is created if an image with the target name exists
pub struct StepPreValidate {
    client: Arc<dyn CloudClient>,
    image_name: String,
    skip_create_image: bool,
}

impl StepPreValidate {
    pub fn new(client: Arc<dyn CloudClient>, image_name: impl Into<String>, skip_create_image: bool) -> Self {
        Self {
            client,
            image_name: image_name.into(),
            skip_create_image,
        }
    }
}

#[async_trait]
impl Step for StepPreValidate {
    fn name(&self) -> &'static str {
        "pre_validate"
    }

    #[instrument(skip_all, fields(image_name = %self.image_name))]
    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        // Nothing to collide with when no image will be created
        if self.skip_create_image {
            return StepAction::Continue;
        }

        info!("Checking image name");
        match self.client.find_image_by_name(&self.image_name).await {
            Ok(None) => {
                info!("Image name is available");
                StepAction::Continue
            }
            Ok(Some(existing)) => halt(
                state,
                self.name(),
                BuildError::Precondition(format!(
                    "image name '{}' already exists ({})",
                    self.image_name, existing.id
                )),
            ),
            Err(err) => halt(
                state,
                self.name(),
                BuildError::remote("failed to look up existing images", err),
            ),
        }
    }
}
