//! Container domain: create, lifecycle, inspect, and log tailing for model
//! containers.

use super::client::{DockerClient, DriverError};
use super::network::NetworkChoice;

use bollard::models::{
    ContainerCreateBody, DeviceRequest, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use futures_util::stream::StreamExt;
use std::collections::HashMap;

/// A bind mount requested for a model container.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to create one model container. The argv and env are
/// rendered by `engines::render`; this layer treats them as opaque.
#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub mounts: Vec<MountSpec>,
    /// Explicit GPU index set; `None` requests no GPU access.
    pub gpu_indices: Option<Vec<u32>>,
    pub network: NetworkChoice,
}

/// Coarse runtime state of a container, as the reconciler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRunState {
    Created,
    Running,
    Exited { code: i64 },
    /// No container with that id/name exists.
    Gone,
}

/// One row of a name-prefix scan, used by the orphan sweep.
#[derive(Debug, Clone)]
pub struct PrefixedContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
}

impl DockerClient {
    /// Create a model container. Restart policy is always `no`: a crashed
    /// engine stays down until the operator starts it again.
    pub async fn create_model_container(
        &self,
        spec: &ContainerCreateSpec,
    ) -> Result<String, DriverError> {
        let exposed = format!("{}/tcp", spec.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            exposed.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                if m.read_only {
                    format!("{}:{}:ro", m.host, m.container)
                } else {
                    format!("{}:{}", m.host, m.container)
                }
            })
            .collect();

        let device_requests = spec.gpu_indices.as_ref().map(|indices| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(indices.iter().map(|i| i.to_string()).collect()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let network_mode = match &spec.network {
            NetworkChoice::Named(name) => Some(name.clone()),
            NetworkChoice::DefaultBridge => None,
        };

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: Some(port_bindings),
            device_requests,
            network_mode,
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(vec![exposed]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let created = self.client.create_container(options, body).await?;
        tracing::debug!(container = %spec.name, id = %created.id, "Created model container");
        Ok(created.id)
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> Result<(), DriverError> {
        self.client
            .start_container(
                container_id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    DriverError::ContainerNotFound(container_id.to_string())
                }
                other => DriverError::Api(other),
            })
    }

    /// Stop a running container, waiting up to `timeout_secs` before the
    /// daemon kills it.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout_secs: u32,
    ) -> Result<(), DriverError> {
        let options = Some(StopContainerOptions {
            t: Some(timeout_secs as i32),
            ..Default::default()
        });

        self.client
            .stop_container(container_id, options)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    DriverError::ContainerNotFound(container_id.to_string())
                }
                other => DriverError::Api(other),
            })
    }

    /// Remove a container. If `force` is true, the container is killed first.
    pub async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), DriverError> {
        let options = Some(RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        });

        self.client
            .remove_container(container_id, options)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    DriverError::ContainerNotFound(container_id.to_string())
                }
                other => DriverError::Api(other),
            })
    }

    /// Coarse run state for the reconciler. A missing container maps to
    /// `Gone` rather than an error.
    pub async fn run_state(&self, container_id: &str) -> Result<ContainerRunState, DriverError> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(details) => details,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(ContainerRunState::Gone),
            Err(e) => return Err(DriverError::Api(e)),
        };

        let state = match inspect.state {
            Some(s) => s,
            None => return Ok(ContainerRunState::Created),
        };

        if state.running == Some(true) {
            return Ok(ContainerRunState::Running);
        }
        match state.status.as_ref().map(|s| s.to_string()).as_deref() {
            Some("created") => Ok(ContainerRunState::Created),
            _ => Ok(ContainerRunState::Exited {
                code: state.exit_code.unwrap_or(-1),
            }),
        }
    }

    /// Collect the last `tail` lines of a container's stdout+stderr into one
    /// string. Non-UTF-8 bytes are replaced, not dropped.
    pub async fn log_tail(&self, container_id: &str, tail: u32) -> Result<String, DriverError> {
        let options = LogsOptions {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(line) => out.push_str(&String::from_utf8_lossy(&line.into_bytes())),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(DriverError::ContainerNotFound(container_id.to_string()));
                }
                Err(e) => return Err(DriverError::Api(e)),
            }
        }
        Ok(out)
    }

    /// List containers (running or not) whose name starts with `prefix`.
    /// The daemon reports names with a leading slash; it is stripped here.
    pub async fn list_prefixed_containers(
        &self,
        prefix: &str,
    ) -> Result<Vec<PrefixedContainer>, DriverError> {
        let options = Some(ListContainersOptions {
            all: true,
            ..Default::default()
        });

        let containers = self.client.list_containers(options).await?;

        let mut matched = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if !name.starts_with(prefix) {
                continue;
            }
            matched.push(PrefixedContainer {
                id: c.id.unwrap_or_default(),
                name,
                running: c.state.map(|s| s.to_string()) == Some("running".to_string()),
            });
        }
        Ok(matched)
    }
}
