//! Container driver seam.
//!
//! The lifecycle manager and reconciler talk to this trait rather than the
//! Docker client directly; tests substitute an in-memory fake.

use async_trait::async_trait;
use runtime::docker::{
    ContainerCreateSpec, ContainerRunState, DockerClient, DriverError, ImageFacts, NetworkChoice,
    PrefixedContainer,
};

#[async_trait]
pub trait ModelDriver: Send + Sync {
    async fn image_cached(&self, reference: &str) -> Result<Option<ImageFacts>, DriverError>;
    async fn list_images(&self) -> Result<Vec<ImageFacts>, DriverError>;
    async fn ensure_network(&self, name: &str) -> Result<NetworkChoice, DriverError>;
    async fn create_model_container(
        &self,
        spec: &ContainerCreateSpec,
    ) -> Result<String, DriverError>;
    async fn start_container(&self, id: &str) -> Result<(), DriverError>;
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), DriverError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DriverError>;
    async fn run_state(&self, id: &str) -> Result<ContainerRunState, DriverError>;
    async fn log_tail(&self, id: &str, tail: u32) -> Result<String, DriverError>;
    async fn list_prefixed_containers(
        &self,
        prefix: &str,
    ) -> Result<Vec<PrefixedContainer>, DriverError>;
    async fn ping(&self) -> Result<(), DriverError>;
}

#[async_trait]
impl ModelDriver for DockerClient {
    async fn image_cached(&self, reference: &str) -> Result<Option<ImageFacts>, DriverError> {
        DockerClient::image_cached(self, reference).await
    }

    async fn list_images(&self) -> Result<Vec<ImageFacts>, DriverError> {
        DockerClient::list_images(self).await
    }

    async fn ensure_network(&self, name: &str) -> Result<NetworkChoice, DriverError> {
        DockerClient::ensure_network(self, name).await
    }

    async fn create_model_container(
        &self,
        spec: &ContainerCreateSpec,
    ) -> Result<String, DriverError> {
        DockerClient::create_model_container(self, spec).await
    }

    async fn start_container(&self, id: &str) -> Result<(), DriverError> {
        DockerClient::start_container(self, id).await
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), DriverError> {
        DockerClient::stop_container(self, id, timeout_secs).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DriverError> {
        DockerClient::remove_container(self, id, force).await
    }

    async fn run_state(&self, id: &str) -> Result<ContainerRunState, DriverError> {
        DockerClient::run_state(self, id).await
    }

    async fn log_tail(&self, id: &str, tail: u32) -> Result<String, DriverError> {
        DockerClient::log_tail(self, id, tail).await
    }

    async fn list_prefixed_containers(
        &self,
        prefix: &str,
    ) -> Result<Vec<PrefixedContainer>, DriverError> {
        DockerClient::list_prefixed_containers(self, prefix).await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        DockerClient::ping(self).await
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory driver fake for lifecycle tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub id: String,
        pub name: String,
        pub state: ContainerRunState,
        pub spec_image: String,
    }

    #[derive(Default)]
    pub struct FakeDriver {
        pub containers: Mutex<HashMap<String, FakeContainer>>,
        pub images: Mutex<Vec<String>>,
        pub logs: Mutex<HashMap<String, String>>,
    }

    impl FakeDriver {
        pub fn with_images(images: &[&str]) -> Self {
            Self {
                images: Mutex::new(images.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }
        }

        /// Simulate a container crash.
        pub fn exit_container(&self, name: &str, code: i64) {
            if let Some(c) = self.containers.lock().get_mut(name) {
                c.state = ContainerRunState::Exited { code };
            }
        }

        /// Simulate the engine process coming up.
        pub fn mark_running(&self, name: &str) {
            if let Some(c) = self.containers.lock().get_mut(name) {
                c.state = ContainerRunState::Running;
            }
        }

        pub fn container_names(&self) -> Vec<String> {
            self.containers.lock().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl ModelDriver for FakeDriver {
        async fn image_cached(&self, reference: &str) -> Result<Option<ImageFacts>, DriverError> {
            Ok(self
                .images
                .lock()
                .iter()
                .find(|i| i.as_str() == reference)
                .map(|i| ImageFacts {
                    id: format!("sha256:{i}"),
                    reference: i.clone(),
                    size_bytes: 1024,
                    created: 0,
                }))
        }

        async fn list_images(&self) -> Result<Vec<ImageFacts>, DriverError> {
            Ok(self
                .images
                .lock()
                .iter()
                .map(|i| ImageFacts {
                    id: format!("sha256:{i}"),
                    reference: i.clone(),
                    size_bytes: 1024,
                    created: 0,
                })
                .collect())
        }

        async fn ensure_network(&self, name: &str) -> Result<NetworkChoice, DriverError> {
            Ok(NetworkChoice::Named(name.to_string()))
        }

        async fn create_model_container(
            &self,
            spec: &ContainerCreateSpec,
        ) -> Result<String, DriverError> {
            let container = FakeContainer {
                id: format!("fake-{}", spec.name),
                name: spec.name.clone(),
                state: ContainerRunState::Created,
                spec_image: spec.image.clone(),
            };
            let id = container.id.clone();
            self.containers.lock().insert(spec.name.clone(), container);
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<(), DriverError> {
            let mut containers = self.containers.lock();
            let container = containers
                .values_mut()
                .find(|c| c.id == id || c.name == id)
                .ok_or_else(|| DriverError::ContainerNotFound(id.to_string()))?;
            container.state = ContainerRunState::Running;
            Ok(())
        }

        async fn stop_container(&self, id: &str, _timeout_secs: u32) -> Result<(), DriverError> {
            let mut containers = self.containers.lock();
            let container = containers
                .values_mut()
                .find(|c| c.id == id || c.name == id)
                .ok_or_else(|| DriverError::ContainerNotFound(id.to_string()))?;
            container.state = ContainerRunState::Exited { code: 0 };
            Ok(())
        }

        async fn remove_container(&self, id: &str, _force: bool) -> Result<(), DriverError> {
            let mut containers = self.containers.lock();
            let name = containers
                .values()
                .find(|c| c.id == id || c.name == id)
                .map(|c| c.name.clone())
                .ok_or_else(|| DriverError::ContainerNotFound(id.to_string()))?;
            containers.remove(&name);
            Ok(())
        }

        async fn run_state(&self, id: &str) -> Result<ContainerRunState, DriverError> {
            Ok(self
                .containers
                .lock()
                .values()
                .find(|c| c.id == id || c.name == id)
                .map(|c| c.state.clone())
                .unwrap_or(ContainerRunState::Gone))
        }

        async fn log_tail(&self, id: &str, _tail: u32) -> Result<String, DriverError> {
            Ok(self.logs.lock().get(id).cloned().unwrap_or_default())
        }

        async fn list_prefixed_containers(
            &self,
            prefix: &str,
        ) -> Result<Vec<PrefixedContainer>, DriverError> {
            Ok(self
                .containers
                .lock()
                .values()
                .filter(|c| c.name.starts_with(prefix))
                .map(|c| PrefixedContainer {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    running: c.state == ContainerRunState::Running,
                })
                .collect())
        }

        async fn ping(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }
}
