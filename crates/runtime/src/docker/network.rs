//! Network domain: ensure the private model network exists.

use super::client::{DockerClient, DriverError};

/// The network a model container ends up attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkChoice {
    /// The named private bridge network.
    Named(String),
    /// The runtime default bridge, used when the named network could not be
    /// created.
    DefaultBridge,
}

impl DockerClient {
    /// Ensure the named bridge network exists, creating it if missing.
    /// Creation failure degrades to the default bridge with a warning
    /// rather than failing the model start.
    pub async fn ensure_network(&self, name: &str) -> Result<NetworkChoice, DriverError> {
        let existing = self
            .client
            .inspect_network(
                name,
                None::<bollard::query_parameters::InspectNetworkOptions>,
            )
            .await;

        match existing {
            Ok(_) => return Ok(NetworkChoice::Named(name.to_string())),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(DriverError::Api(e)),
        }

        use bollard::models::NetworkCreateRequest;
        use std::collections::HashMap;

        let mut labels = HashMap::new();
        labels.insert("cortex.managed".to_string(), "true".to_string());

        let config = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            labels: Some(labels),
            ..Default::default()
        };

        match self.client.create_network(config).await {
            Ok(_) => {
                tracing::info!(network = name, "Created model network");
                Ok(NetworkChoice::Named(name.to_string()))
            }
            Err(e) => {
                tracing::warn!(
                    network = name,
                    error = %e,
                    "Failed to create model network, falling back to default bridge"
                );
                Ok(NetworkChoice::DefaultBridge)
            }
        }
    }
}
