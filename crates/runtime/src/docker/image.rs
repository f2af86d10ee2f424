//! Image domain: enumeration of locally cached engine images.
//!
//! There is deliberately no pull method. The control plane can only launch
//! from images already present on the host, which keeps the offline policy
//! enforceable at the type level.

use super::client::{DockerClient, DriverError};

/// Facts about one locally cached image.
#[derive(Debug, Clone)]
pub struct ImageFacts {
    pub id: String,
    pub reference: String,
    pub size_bytes: i64,
    pub created: i64,
}

impl DockerClient {
    /// List all images on the Docker host.
    pub async fn list_images(&self) -> Result<Vec<ImageFacts>, DriverError> {
        use bollard::query_parameters::ListImagesOptions;

        let options = Some(ListImagesOptions {
            all: false,
            ..Default::default()
        });

        let summaries = self.client.list_images(options).await?;

        let mut images = Vec::new();
        for s in summaries {
            for tag in &s.repo_tags {
                images.push(ImageFacts {
                    id: s.id.clone(),
                    reference: tag.clone(),
                    size_bytes: s.size,
                    created: s.created,
                });
            }
        }
        Ok(images)
    }

    /// Look up one image reference in the local cache. A bare reference
    /// without a tag matches its `:latest` form.
    pub async fn image_cached(&self, reference: &str) -> Result<Option<ImageFacts>, DriverError> {
        let wanted_latest = if reference.contains(':') {
            None
        } else {
            Some(format!("{reference}:latest"))
        };

        let images = self.list_images().await?;
        Ok(images.into_iter().find(|img| {
            img.reference == reference || Some(&img.reference) == wanted_latest.as_ref()
        }))
    }
}
