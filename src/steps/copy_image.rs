//! Propagates the image to additional regions.
//!
//! Every region is attempted concurrently and every region is awaited.
//! Copies that become ready are recorded; if any region fails the step
//! halts with a partial-propagation error that lists the failed regions,
//! and the images already recorded are still returned to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::create_image::wait_for_image;
use crate::adapters::CloudClient;
use crate::core::poll::PollPolicy;
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::{BuildError, RegionFailure};

/// Result of copying to one region
struct RegionCopy {
    region: String,
    /// Id issued by the control plane, if the copy was accepted
    image_id: Option<String>,
    result: Result<(), BuildError>,
}

pub struct StepCopyImage {
    client: Arc<dyn CloudClient>,
    regions: Vec<String>,
    poll: PollPolicy,
    copies: Vec<(String, String)>,
}

impl StepCopyImage {
    pub fn new(client: Arc<dyn CloudClient>, regions: Vec<String>, poll: PollPolicy) -> Self {
        Self {
            client,
            regions,
            poll,
            copies: Vec::new(),
        }
    }

    async fn copy_to(
        client: Arc<dyn CloudClient>,
        cancel: CancellationToken,
        poll: PollPolicy,
        image_id: String,
        region: String,
    ) -> RegionCopy {
        let copy_id = match client.copy_image(&image_id, &region).await {
            Ok(copy_id) => copy_id,
            Err(err) => {
                return RegionCopy {
                    region,
                    image_id: None,
                    result: Err(BuildError::remote("failed to copy image", err)),
                }
            }
        };

        info!(%region, image_id = %copy_id, "Waiting for image copy");
        let result = wait_for_image(&client, &cancel, &poll, &region, &copy_id)
            .await
            .map(|_| ());
        RegionCopy {
            region,
            image_id: Some(copy_id),
            result,
        }
    }

    #[instrument(skip_all, fields(regions = self.regions.len()))]
    async fn propagate(
        &mut self,
        cancel: &CancellationToken,
        state: &mut StateBag,
        image_id: String,
    ) -> Result<(), BuildError> {
        let copies = self.regions.iter().map(|region| {
            Self::copy_to(
                self.client.clone(),
                cancel.clone(),
                self.poll,
                image_id.clone(),
                region.clone(),
            )
        });

        let mut failed = Vec::new();
        let mut cancelled = None;

        for copy in join_all(copies).await {
            // Accepted copies are tracked for cleanup even if they never became ready
            if let Some(copy_id) = &copy.image_id {
                self.copies.push((copy.region.clone(), copy_id.clone()));
            }

            match copy.result {
                Ok(()) => {
                    if let Some(copy_id) = copy.image_id {
                        info!(region = %copy.region, image_id = %copy_id, "Image copied");
                        state.insert_image(copy.region, copy_id);
                    }
                }
                Err(err) if err.is_cancelled() => cancelled = Some(err),
                Err(err) => {
                    warn!(region = %copy.region, error = %err, "Image copy failed");
                    failed.push(RegionFailure {
                        region: copy.region,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if let Some(err) = cancelled {
            return Err(err);
        }
        if !failed.is_empty() {
            return Err(BuildError::PartialPropagation { failed });
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepCopyImage {
    fn name(&self) -> &'static str {
        "copy_image"
    }

    fn writes(&self) -> &'static [StateKey] {
        &[StateKey::Images]
    }

    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        if self.regions.is_empty() {
            return StepAction::Continue;
        }
        let Some(image_id) = state.id(StateKey::ImageId).map(str::to_string) else {
            return StepAction::Continue;
        };

        match self.propagate(cancel, state, image_id).await {
            Ok(()) => StepAction::Continue,
            Err(err) => halt(state, self.name(), err),
        }
    }

    async fn cleanup(&mut self, state: &mut StateBag) -> anyhow::Result<()> {
        let copies = std::mem::take(&mut self.copies);
        let failed_build = state.is_failed_build();

        // Copies missing from the artifact are never handed to the caller
        let doomed: Vec<(String, String)> = copies
            .into_iter()
            .filter(|(region, image_id)| {
                let in_artifact = state
                    .images()
                    .and_then(|images| images.get(region))
                    .is_some_and(|recorded| recorded == image_id);
                failed_build || !in_artifact
            })
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let deletions = doomed.iter().map(|(region, image_id)| {
            let client = self.client.clone();
            async move {
                info!(%region, %image_id, "Deleting unusable image copy");
                client
                    .delete_image(region, image_id)
                    .await
                    .map_err(|err| format!("{}: {}", region, err))
            }
        });

        let failures: Vec<String> = join_all(deletions)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Failed to delete image copies: {}", failures.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;
    use std::time::Duration;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    fn state() -> StateBag {
        let mut state = StateBag::new();
        state.put_id(StateKey::ImageId, "img-1");
        state.insert_image("ap-guangzhou", "img-1");
        state
    }

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_copies_to_every_region() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-1", "web"));
        let mut state = state();
        let mut step = StepCopyImage::new(
            cloud.clone(),
            regions(&["ap-shanghai", "ap-tokyo"]),
            policy(),
        );

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        let images = state.images().unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(cloud.images_in("ap-tokyo")[0].0, images["ap-tokyo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_keeps_successful_copies() {
        let cloud = Arc::new(
            SimulatedCloud::new("ap-guangzhou")
                .with_image("img-1", "web")
                .fail_copy_to("ap-shanghai"),
        );
        let mut state = state();
        let mut step = StepCopyImage::new(
            cloud.clone(),
            regions(&["ap-shanghai", "ap-tokyo"]),
            policy(),
        );

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        let err = state.error().unwrap();
        assert!(err.is_partial_propagation());
        assert_eq!(err.failed_regions(), vec!["ap-shanghai"]);
        assert!(state.images().unwrap().contains_key("ap-tokyo"));

        // Partial propagation is not a failed build: copies stay
        assert!(!state.is_failed_build());
        step.cleanup(&mut state).await.unwrap();
        assert_eq!(cloud.images_in("ap-tokyo").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_that_fails_after_acceptance_is_removed() {
        let cloud = Arc::new(
            SimulatedCloud::new("ap-guangzhou")
                .with_image("img-1", "web")
                .break_copies_in("ap-tokyo"),
        );
        let mut state = state();
        let mut step = StepCopyImage::new(
            cloud.clone(),
            regions(&["ap-shanghai", "ap-tokyo"]),
            policy(),
        );

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Halt
        );
        assert_eq!(state.error().unwrap().failed_regions(), vec!["ap-tokyo"]);
        assert_eq!(cloud.images_in("ap-tokyo").len(), 1);

        step.cleanup(&mut state).await.unwrap();

        // The failed copy is gone, the usable one stays with the artifact
        assert!(cloud.images_in("ap-tokyo").is_empty());
        assert_eq!(cloud.images_in("ap-shanghai").len(), 1);
        assert!(state.images().unwrap().contains_key("ap-shanghai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_copies_are_deleted() {
        let cloud = Arc::new(
            SimulatedCloud::new("ap-guangzhou")
                .with_image("img-1", "web")
                .with_stalled_images(),
        );
        let mut state = state();
        let mut step = StepCopyImage::new(cloud.clone(), regions(&["ap-tokyo"]), policy());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        assert_eq!(step.run(&cancel, &mut state).await, StepAction::Halt);
        assert!(state.error().unwrap().is_cancelled());
        assert_eq!(cloud.images_in("ap-tokyo").len(), 1);

        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.images_in("ap-tokyo").is_empty());
    }

    #[tokio::test]
    async fn test_no_regions_is_noop() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let mut state = state();
        let mut step = StepCopyImage::new(cloud.clone(), Vec::new(), policy());

        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert!(cloud.calls().is_empty());
    }
}
