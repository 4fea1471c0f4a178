//! Confirms the source image exists in the build region.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::CloudClient;
use crate::core::state::{StateBag, StateKey, StateValue};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepCheckSourceImage {
    client: Arc<dyn CloudClient>,
    source_image_id: String,
}

impl StepCheckSourceImage {
    pub fn new(client: Arc<dyn CloudClient>, source_image_id: impl Into<String>) -> Self {
        Self {
            client,
            source_image_id: source_image_id.into(),
        }
    }
}

#[async_trait]
impl Step for StepCheckSourceImage {
    fn name(&self) -> &'static str {
        "check_source_image"
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::SourceImage, StateKey::GeneratedData]
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let region = self.client.region().to_string();
        info!(source_image_id = %self.source_image_id, "Checking source image");

        match self.client.describe_image(&region, &self.source_image_id).await {
            Ok(Some(image)) => {
                state.insert_generated("SourceImageId", image.id.clone());
                state.insert_generated("SourceImageName", image.name.clone());
                state.put(StateKey::SourceImage, StateValue::Image(image));
                StepAction::Continue
            }
            Ok(None) => halt(
                state,
                self.name(),
                BuildError::Precondition(format!(
                    "source image '{}' not found in {}",
                    self.source_image_id, region
                )),
            ),
            Err(err) => halt(
                state,
                self.name(),
                BuildError::remote("failed to describe source image", err),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;

    #[tokio::test]
    async fn test_records_source_image() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-src", "centos"));
        let mut step = StepCheckSourceImage::new(cloud, "img-src");
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert_eq!(state.source_image().unwrap().name, "centos");
        assert_eq!(state.generated_data().unwrap()["SourceImageId"], "img-src");
    }

    #[tokio::test]
    async fn test_missing_source_image_halts() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let mut step = StepCheckSourceImage::new(cloud, "img-nope");
        let mut state = StateBag::new();

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        assert!(state.error().unwrap().to_string().contains("img-nope"));
    }
}
