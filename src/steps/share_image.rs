//! Grants launch permission on the image to other accounts.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::CloudClient;
use crate::core::state::{StateBag, StateKey};
use crate::core::step::{halt, Step, StepAction};
use crate::error::BuildError;

pub struct StepShareImage {
    client: Arc<dyn CloudClient>,
    accounts: Vec<String>,
    shared: Option<String>,
}

impl StepShareImage {
    pub fn new(client: Arc<dyn CloudClient>, accounts: Vec<String>) -> Self {
        Self {
            client,
            accounts,
            shared: None,
        }
    }
}

#[async_trait]
impl Step for StepShareImage {
    fn name(&self) -> &'static str {
        "share_image"
    }

    async fn run(&mut self, _cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        if self.accounts.is_empty() {
            return StepAction::Continue;
        }
        let Some(image_id) = state.id(StateKey::ImageId).map(str::to_string) else {
            return StepAction::Continue;
        };

        info!(%image_id, accounts = ?self.accounts, "Sharing image");
        match self.client.share_image(&image_id, &self.accounts).await {
            Ok(()) => {
                self.shared = Some(image_id);
                StepAction::Continue
            }
            Err(err) => halt(
                state,
                self.name(),
                BuildError::remote("failed to share image", err),
            ),
        }
    }

    async fn cleanup(&mut self, state: &mut StateBag) -> anyhow::Result<()> {
        if !state.is_failed_build() {
            return Ok(());
        }
        let Some(image_id) = self.shared.take() else {
            return Ok(());
        };

        info!(%image_id, "Revoking image sharing");
        self.client
            .unshare_image(&image_id, &self.accounts)
            .await
            .with_context(|| format!("Failed to revoke sharing of image {}", image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;

    fn accounts() -> Vec<String> {
        vec!["100001".to_string(), "100002".to_string()]
    }

    #[tokio::test]
    async fn test_share_then_revoke_on_failed_build() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-1", "web"));
        let mut state = StateBag::new();
        state.put_id(StateKey::ImageId, "img-1");

        let mut step = StepShareImage::new(cloud.clone(), accounts());
        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert_eq!(cloud.shared_accounts("img-1"), accounts());

        state.set_error(BuildError::cancelled("copying image"));
        step.cleanup(&mut state).await.unwrap();
        assert!(cloud.shared_accounts("img-1").is_empty());
    }

    #[tokio::test]
    async fn test_sharing_kept_on_success() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-1", "web"));
        let mut state = StateBag::new();
        state.put_id(StateKey::ImageId, "img-1");

        let mut step = StepShareImage::new(cloud.clone(), accounts());
        step.run(&CancellationToken::new(), &mut state).await;
        step.cleanup(&mut state).await.unwrap();

        assert_eq!(cloud.shared_accounts("img-1").len(), 2);
    }

    #[tokio::test]
    async fn test_no_image_is_noop() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou"));
        let mut state = StateBag::new();

        let mut step = StepShareImage::new(cloud.clone(), accounts());
        assert_eq!(
            step.run(&CancellationToken::new(), &mut state).await,
            StepAction::Continue
        );
        assert!(cloud.calls().is_empty());
    }
}
