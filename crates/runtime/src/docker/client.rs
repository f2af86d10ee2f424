//! Docker client: core struct, constructor, error type.
//!
//! Domain methods live in sibling modules (`container`, `image`, `network`)
//! which add `impl DockerClient` blocks.

use bollard::Docker;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Docker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    /// The bollard Docker client.  `pub(super)` so that domain modules
    /// in sibling files can call bollard APIs directly.
    pub(super) client: Docker,
}

impl DockerClient {
    /// Connect to the local daemon. An empty socket path uses the platform
    /// default connection.
    pub fn new(socket_path: &str) -> Result<Self, DriverError> {
        let connection = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| DriverError::ConnectionFailed(e.to_string()))?
        };

        Ok(DockerClient { client: connection })
    }

    /// Daemon reachability check, used by the readiness probe.
    pub async fn ping(&self) -> Result<(), DriverError> {
        self.client.ping().await.map_err(DriverError::from)?;
        Ok(())
    }
}
