//! The build artifact: the baked image in every region it reached.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::adapters::CloudClient;
use crate::error::{BuildError, RegionFailure};

/// Identifies artifacts produced by this builder
pub const BUILDER_ID: &str = "cvmbake.image";

/// Images produced by a build, plus the client needed to delete them
pub struct Artifact {
    /// Region -> image id
    pub images: BTreeMap<String, String>,

    /// Metadata gathered during the build
    pub generated_data: Map<String, Value>,

    client: Arc<dyn CloudClient>,
}

impl Artifact {
    pub fn new(
        images: BTreeMap<String, String>,
        generated_data: Map<String, Value>,
        client: Arc<dyn CloudClient>,
    ) -> Self {
        Self {
            images,
            generated_data,
            client,
        }
    }

    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// `region:image` pairs, sorted by region and comma separated
    pub fn id(&self) -> String {
        self.images
            .iter()
            .map(|(region, image)| format!("{}:{}", region, image))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn image_in(&self, region: &str) -> Option<&str> {
        self.images.get(region).map(String::as_str)
    }

    /// Serializable record for downstream tooling
    pub fn manifest(&self) -> ArtifactManifest {
        ArtifactManifest {
            builder_id: BUILDER_ID.to_string(),
            artifact_id: self.id(),
            images: self.images.clone(),
            generated_data: self.generated_data.clone(),
        }
    }

    /// Delete the image in every region. All regions are attempted.
    pub async fn destroy(&self) -> Result<(), BuildError> {
        info!(artifact = %self.id(), "Deleting images");

        let deletions = self.images.iter().map(|(region, image)| {
            let client = self.client.clone();
            async move {
                client
                    .delete_image(region, image)
                    .await
                    .map_err(|err| RegionFailure {
                        region: region.clone(),
                        reason: err.to_string(),
                    })
            }
        });

        let failed: Vec<RegionFailure> = join_all(deletions)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            for failure in &failed {
                warn!(region = %failure.region, reason = %failure.reason, "Image deletion failed");
            }
            Err(BuildError::Destroy { failed })
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("images", &self.images)
            .field("generated_data", &self.generated_data)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Images were created:")?;
        for (region, image) in &self.images {
            writeln!(f, "{}: {}", region, image)?;
        }
        Ok(())
    }
}

/// JSON manifest written by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub builder_id: String,
    pub artifact_id: String,
    pub images: BTreeMap<String, String>,
    pub generated_data: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedCloud;

    async fn cloud_with_copies() -> (Arc<SimulatedCloud>, BTreeMap<String, String>) {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-a", "baked"));
        let copy = cloud.copy_image("img-a", "ap-shanghai").await.unwrap();

        let images: BTreeMap<String, String> = [
            ("ap-guangzhou".to_string(), "img-a".to_string()),
            ("ap-shanghai".to_string(), copy),
        ]
        .into_iter()
        .collect();
        (cloud, images)
    }

    #[tokio::test]
    async fn test_id_is_sorted_region_pairs() {
        let (cloud, images) = cloud_with_copies().await;
        let shanghai = images["ap-shanghai"].clone();
        let artifact = Artifact::new(images, Map::new(), cloud);

        assert_eq!(
            artifact.id(),
            format!("ap-guangzhou:img-a,ap-shanghai:{}", shanghai)
        );
        assert_eq!(artifact.builder_id(), BUILDER_ID);
        assert!(artifact.to_string().contains("ap-guangzhou: img-a"));
    }

    #[tokio::test]
    async fn test_destroy_deletes_every_region() {
        let (cloud, images) = cloud_with_copies().await;
        let artifact = Artifact::new(images, Map::new(), cloud.clone());

        artifact.destroy().await.unwrap();

        assert!(cloud.images_in("ap-guangzhou").is_empty());
        assert!(cloud.images_in("ap-shanghai").is_empty());
        assert_eq!(cloud.call_count("DeleteImages"), 2);
    }

    #[tokio::test]
    async fn test_destroy_reports_missing_regions() {
        let cloud = Arc::new(SimulatedCloud::new("ap-guangzhou").with_image("img-a", "baked"));
        let images: BTreeMap<String, String> = [
            ("ap-guangzhou".to_string(), "img-a".to_string()),
            ("ap-tokyo".to_string(), "img-gone".to_string()),
        ]
        .into_iter()
        .collect();
        let artifact = Artifact::new(images, Map::new(), cloud.clone());

        let err = artifact.destroy().await.unwrap_err();

        assert_eq!(err.failed_regions(), vec!["ap-tokyo"]);
        assert!(cloud.images_in("ap-guangzhou").is_empty());
    }

    #[tokio::test]
    async fn test_manifest_serialization() {
        let (cloud, images) = cloud_with_copies().await;
        let mut data = Map::new();
        data.insert("SourceImageId".into(), Value::from("img-src"));
        let artifact = Artifact::new(images, data, cloud);

        let json = serde_json::to_string(&artifact.manifest()).unwrap();
        let parsed: ArtifactManifest = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.builder_id, BUILDER_ID);
        assert_eq!(parsed.images.len(), 2);
        assert_eq!(parsed.generated_data["SourceImageId"], "img-src");
    }
}
