//! Model lifecycle manager.
//!
//! Sole mutator of model state and runtime fields. Turns a declared model
//! into a running container and back, with deterministic transitions:
//! stopped -> starting -> loading -> running, failures land in `failed`.

pub mod driver;
pub mod reconcile;

pub use driver::ModelDriver;

use runtime::docker::{ContainerCreateSpec, MountSpec};
use runtime::engines::{EngineKind, EngineParams, LaunchInputs, RenderedLaunch};
use runtime::weights::{self, WeightsError};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ModelsConfig;
use crate::error::ApiError;
use crate::health::{HealthBoard, ProbeKind};
use crate::registry::UpstreamRegistry;
use crate::store::{ModelPatch, ModelRecord, ModelState, NewModel, Store};

/// Container-side mount points.
const MODELS_MOUNT: &str = "/models";
const DOWNLOAD_CACHE_MOUNT: &str = "/hub-cache";

pub struct LifecycleManager {
    store: Store,
    driver: Arc<dyn ModelDriver>,
    registry: Arc<UpstreamRegistry>,
    health: Arc<HealthBoard>,
    models_cfg: ModelsConfig,
    internal_key: String,
    http: reqwest::Client,
}

/// Pre-flight output: everything `start` needs that can fail without any
/// state change.
struct PreparedLaunch {
    image: String,
    model_arg: String,
    uses_download_cache: bool,
}

pub fn probe_kind_for(engine: EngineKind) -> ProbeKind {
    match engine {
        EngineKind::TransformerEngine => ProbeKind::HealthEndpoint,
        EngineKind::QuantizedEngine => ProbeKind::ListModels,
    }
}

/// Source rule: quantized models must name a local path; transformer
/// models name exactly one of a remote repo or a local path.
pub fn validate_source(new: &NewModel) -> Result<(), ApiError> {
    match new.params.kind() {
        EngineKind::QuantizedEngine => {
            if new.local_path.is_none() {
                return Err(ApiError::InvalidRequest(
                    "quantized-engine models require a local path".to_string(),
                ));
            }
            if new.repo_id.is_some() {
                return Err(ApiError::InvalidRequest(
                    "quantized-engine models cannot use a remote repo".to_string(),
                ));
            }
        }
        EngineKind::TransformerEngine => {
            if new.repo_id.is_some() == new.local_path.is_some() {
                return Err(ApiError::InvalidRequest(
                    "exactly one of repo_id or local_path must be set".to_string(),
                ));
            }
        }
    }
    Ok(())
}

impl LifecycleManager {
    pub fn new(
        store: Store,
        driver: Arc<dyn ModelDriver>,
        registry: Arc<UpstreamRegistry>,
        health: Arc<HealthBoard>,
        models_cfg: ModelsConfig,
        internal_key: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            store,
            driver,
            registry,
            health,
            models_cfg,
            internal_key,
            http,
        }
    }

    pub fn upstream_url(record: &ModelRecord) -> Option<String> {
        record.host_port.map(|port| format!("http://127.0.0.1:{port}"))
    }

    fn image_for(&self, engine: EngineKind) -> String {
        match engine {
            EngineKind::TransformerEngine => self.models_cfg.transformer_image.clone(),
            EngineKind::QuantizedEngine => self.models_cfg.quantized_image.clone(),
        }
    }

    /// Start a model: pre-flight, port, network, container, transition.
    /// Readiness observation is delegated to the health poller; this call
    /// does not block on the engine coming up.
    pub async fn start(&self, model_id: i64) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if !matches!(model.state, ModelState::Stopped | ModelState::Failed) {
            return Err(ApiError::InvalidState {
                action: "start",
                state: model.state,
            });
        }

        // Pre-flight failures are synchronous and leave no state behind.
        let prepared = self.preflight(&model).await?;

        let taken: HashSet<u16> = self
            .store
            .live_models()
            .await?
            .iter()
            .filter_map(|m| m.host_port)
            .collect();
        let host_port = self.find_free_port(&taken).await?;

        let network = self
            .driver
            .ensure_network(&self.models_cfg.network_name)
            .await
            .map_err(|e| ApiError::Internal(format!("network setup failed: {e}")))?;

        let container_port = model.engine.container_port();
        let inputs = LaunchInputs {
            model_arg: prepared.model_arg.clone(),
            served_name: model.served_name.clone(),
            task: model.task,
            port: container_port,
            internal_api_key: self.internal_key.clone(),
        };
        let RenderedLaunch { argv, mut env } = runtime::engines::render_command(&model.params, &inputs);

        let mut mounts = vec![MountSpec {
            host: self.models_cfg.root.clone(),
            container: MODELS_MOUNT.to_string(),
            read_only: true,
        }];
        if prepared.uses_download_cache {
            mounts.push(MountSpec {
                host: self.models_cfg.download_cache.clone(),
                container: DOWNLOAD_CACHE_MOUNT.to_string(),
                read_only: false,
            });
            env.push(format!("HF_HOME={DOWNLOAD_CACHE_MOUNT}"));
        }
        if self.models_cfg.offline {
            env.push("HF_HUB_OFFLINE=1".to_string());
        }

        let container_name = model.expected_container_name();
        let spec = ContainerCreateSpec {
            name: container_name.clone(),
            image: prepared.image,
            cmd: argv,
            env,
            host_port,
            container_port,
            mounts,
            gpu_indices: model.params.gpu_indices().map(|g| g.to_vec()),
            network,
        };

        let container_id = match self.driver.create_model_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let reason = format!("container creation failed: {e}");
                self.store
                    .set_model_state(model.id, ModelState::Failed, Some(&reason))
                    .await?;
                return Err(ApiError::Internal(reason));
            }
        };
        if let Err(e) = self.driver.start_container(&container_id).await {
            let reason = format!("container start failed: {e}");
            let _ = self.driver.remove_container(&container_id, true).await;
            self.store
                .set_model_state(model.id, ModelState::Failed, Some(&reason))
                .await?;
            return Err(ApiError::Internal(reason));
        }

        self.store
            .set_model_runtime(model.id, host_port, &container_name)
            .await?;
        self.store
            .set_model_state(model.id, ModelState::Starting, None)
            .await?;

        // Tentative registration: the poller starts probing now and the
        // reconciler promotes the model once the first probe succeeds.
        let url = format!("http://127.0.0.1:{host_port}");
        self.registry
            .register(&model.served_name, &url, model.task)
            .await
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.health.track(&url, probe_kind_for(model.engine));

        tracing::info!(
            model_id = model.id,
            served_name = %model.served_name,
            container = %container_name,
            host_port,
            "Model starting"
        );
        Ok(self.store.get_model(model.id).await?)
    }

    async fn preflight(&self, model: &ModelRecord) -> Result<PreparedLaunch, ApiError> {
        let image = self.image_for(model.engine);
        let cached = self
            .driver
            .image_cached(&image)
            .await
            .map_err(|e| ApiError::Internal(format!("image lookup failed: {e}")))?;
        if cached.is_none() {
            return Err(ApiError::ImageUnavailable { image });
        }

        match model.engine {
            EngineKind::QuantizedEngine => {
                let local = model.local_path.as_deref().ok_or_else(|| {
                    ApiError::InvalidRequest(
                        "quantized-engine models require a local path".to_string(),
                    )
                })?;
                let host_path = self.host_path(local)?;
                let resolved = weights::resolve_weights(&host_path).map_err(|e| match e {
                    WeightsError::IncompleteSplitSet { missing } => {
                        ApiError::IncompleteSplitSet { missing }
                    }
                    WeightsError::NotFound(p) => {
                        ApiError::InvalidRequest(format!("weight path not found: {}", p.display()))
                    }
                    WeightsError::NoWeightFiles(p) => ApiError::InvalidRequest(format!(
                        "no weight files under: {}",
                        p.display()
                    )),
                    WeightsError::Io(e) => ApiError::Internal(format!("weight scan failed: {e}")),
                })?;

                Ok(PreparedLaunch {
                    image,
                    model_arg: self.container_path(resolved.entry_path())?,
                    uses_download_cache: false,
                })
            }
            EngineKind::TransformerEngine => match (&model.local_path, &model.repo_id) {
                (Some(local), _) => Ok(PreparedLaunch {
                    image,
                    model_arg: format!("{MODELS_MOUNT}/{}", local.trim_start_matches('/')),
                    uses_download_cache: false,
                }),
                (None, Some(repo)) => {
                    if self.models_cfg.offline {
                        return Err(ApiError::OfflineRemoteRefused { repo: repo.clone() });
                    }
                    Ok(PreparedLaunch {
                        image,
                        model_arg: repo.clone(),
                        uses_download_cache: true,
                    })
                }
                (None, None) => Err(ApiError::InvalidRequest(
                    "model has neither repo_id nor local_path".to_string(),
                )),
            },
        }
    }

    fn host_path(&self, local: &str) -> Result<PathBuf, ApiError> {
        if Path::new(local).is_absolute() {
            return Err(ApiError::InvalidRequest(
                "local path must be relative to the models root".to_string(),
            ));
        }
        Ok(Path::new(&self.models_cfg.root).join(local))
    }

    /// Map a host-side weight path to its location inside the container.
    fn container_path(&self, host: &Path) -> Result<String, ApiError> {
        let rel = host
            .strip_prefix(&self.models_cfg.root)
            .map_err(|_| ApiError::Internal("weight path escaped models root".to_string()))?;
        Ok(format!("{MODELS_MOUNT}/{}", rel.display()))
    }

    async fn find_free_port(&self, taken: &HashSet<u16>) -> Result<u16, ApiError> {
        for port in self.models_cfg.port_range_start..=self.models_cfg.port_range_end {
            if taken.contains(&port) {
                continue;
            }
            if tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                return Ok(port);
            }
        }
        Err(ApiError::Internal(format!(
            "no free host port in {}..{}",
            self.models_cfg.port_range_start, self.models_cfg.port_range_end
        )))
    }

    /// Stop a model's container and return the record to `stopped`.
    pub async fn stop(&self, model_id: i64) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if !model.state.is_live() {
            return Err(ApiError::InvalidState {
                action: "stop",
                state: model.state,
            });
        }
        self.teardown(&model).await?;
        self.store.clear_model_runtime(model.id).await?;
        self.store
            .set_model_state(model.id, ModelState::Stopped, None)
            .await?;
        tracing::info!(model_id = model.id, served_name = %model.served_name, "Model stopped");
        Ok(self.store.get_model(model.id).await?)
    }

    /// Abort a long weight load. Permitted only while `loading`.
    pub async fn cancel(&self, model_id: i64) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if model.state != ModelState::Loading {
            return Err(ApiError::InvalidState {
                action: "cancel",
                state: model.state,
            });
        }
        self.teardown(&model).await?;
        self.store.clear_model_runtime(model.id).await?;
        self.store
            .set_model_state(model.id, ModelState::Stopped, None)
            .await?;
        Ok(self.store.get_model(model.id).await?)
    }

    /// Remove the container and routing presence. Tolerates a container
    /// that already disappeared.
    async fn teardown(&self, model: &ModelRecord) -> Result<(), ApiError> {
        if let Some(url) = Self::upstream_url(model) {
            self.registry.unregister(&url).await;
            self.health.untrack(&url);
        }

        let name = model.expected_container_name();
        let timeout = model.engine.stop_timeout_secs();
        match self.driver.stop_container(&name, timeout).await {
            Ok(()) => {}
            Err(runtime::docker::DriverError::ContainerNotFound(_)) => {}
            Err(e) => return Err(ApiError::Internal(format!("container stop failed: {e}"))),
        }
        match self.driver.remove_container(&name, true).await {
            Ok(()) => {}
            Err(runtime::docker::DriverError::ContainerNotFound(_)) => {}
            Err(e) => return Err(ApiError::Internal(format!("container removal failed: {e}"))),
        }
        Ok(())
    }

    /// Persist new parameters, then bounce the model. Brief downtime is
    /// part of the contract.
    pub async fn reconfigure(
        &self,
        model_id: i64,
        params: EngineParams,
    ) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        let was_live = model.state.is_live();

        self.store
            .patch_model(
                model_id,
                &ModelPatch {
                    params: Some(params),
                    ..Default::default()
                },
            )
            .await?;

        if was_live {
            self.stop(model_id).await?;
            return self.start(model_id).await;
        }
        Ok(self.store.get_model(model_id).await?)
    }

    pub async fn archive(&self, model_id: i64) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if model.state != ModelState::Stopped {
            return Err(ApiError::InvalidState {
                action: "archive",
                state: model.state,
            });
        }
        self.store
            .set_model_state(model_id, ModelState::Archived, None)
            .await?;
        Ok(self.store.get_model(model_id).await?)
    }

    pub async fn unarchive(&self, model_id: i64) -> Result<ModelRecord, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if model.state != ModelState::Archived {
            return Err(ApiError::InvalidState {
                action: "unarchive",
                state: model.state,
            });
        }
        self.store
            .set_model_state(model_id, ModelState::Stopped, None)
            .await?;
        Ok(self.store.get_model(model_id).await?)
    }

    /// Remove the record. Requires `archived`; never touches weight files.
    pub async fn delete(&self, model_id: i64) -> Result<(), ApiError> {
        let model = self.store.get_model(model_id).await?;
        if model.state != ModelState::Archived {
            return Err(ApiError::InvalidState {
                action: "delete",
                state: model.state,
            });
        }
        self.store.delete_model(model_id).await?;
        Ok(())
    }

    /// Render the launch without creating anything.
    pub async fn dry_run(&self, model_id: i64) -> Result<serde_json::Value, ApiError> {
        let model = self.store.get_model(model_id).await?;
        let prepared = self.preflight(&model).await?;

        let inputs = LaunchInputs {
            model_arg: prepared.model_arg,
            served_name: model.served_name.clone(),
            task: model.task,
            port: model.engine.container_port(),
            internal_api_key: "<internal-key>".to_string(),
        };
        let launch = runtime::engines::render_command(&model.params, &inputs);

        let gpu_count = model.params.gpu_indices().map(|g| g.len()).unwrap_or(0);
        Ok(json!({
            "image": prepared.image,
            "command": launch.argv,
            "env": launch.env,
            "resources": {
                "engine": model.engine.to_string(),
                "task": model.task.to_string(),
                "gpu_count": gpu_count,
            },
        }))
    }

    /// One-shot probe plus a minimal inference round trip.
    pub async fn test_model(&self, model_id: i64) -> Result<serde_json::Value, ApiError> {
        let model = self.store.get_model(model_id).await?;
        if model.state != ModelState::Running {
            return Err(ApiError::InvalidState {
                action: "test",
                state: model.state,
            });
        }
        let url = Self::upstream_url(&model)
            .ok_or_else(|| ApiError::Internal("running model has no port".to_string()))?;

        let probe_path = probe_kind_for(model.engine).path();
        let started = Instant::now();
        let probe = self
            .http
            .get(format!("{url}{probe_path}"))
            .bearer_auth(&self.internal_key)
            .timeout(std::time::Duration::from_secs(3))
            .send()
            .await;
        let probe_ok = probe.as_ref().map(|r| r.status().is_success()).unwrap_or(false);
        let probe_latency = started.elapsed().as_millis() as u64;

        let (path, body) = match model.task {
            runtime::engines::ModelTask::Generate => (
                "/v1/completions",
                json!({ "model": model.served_name, "prompt": "ping", "max_tokens": 1 }),
            ),
            runtime::engines::ModelTask::Embed => (
                "/v1/embeddings",
                json!({ "model": model.served_name, "input": "ping" }),
            ),
        };
        let started = Instant::now();
        let inference = self
            .http
            .post(format!("{url}{path}"))
            .bearer_auth(&self.internal_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await;
        let (inference_status, inference_ok) = match &inference {
            Ok(r) => (Some(r.status().as_u16()), r.status().is_success()),
            Err(_) => (None, false),
        };

        Ok(json!({
            "probe": { "ok": probe_ok, "latency_ms": probe_latency },
            "inference": {
                "ok": inference_ok,
                "status": inference_status,
                "latency_ms": started.elapsed().as_millis() as u64,
            },
        }))
    }

    /// Recent container log tail for the admin surface.
    pub async fn logs(&self, model_id: i64, tail: u32) -> Result<String, ApiError> {
        let model = self.store.get_model(model_id).await?;
        let name = model
            .container_name
            .clone()
            .unwrap_or_else(|| model.expected_container_name());
        self.driver
            .log_tail(&name, tail)
            .await
            .map_err(|e| match e {
                runtime::docker::DriverError::ContainerNotFound(_) => {
                    ApiError::NotFound(format!("no container for model {model_id}"))
                }
                other => ApiError::Internal(other.to_string()),
            })
    }

    /// Stop every live model; used by the shutdown coordinator.
    pub async fn stop_all_live(&self) {
        let live = match self.store.live_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::error!(error = %e, "Failed to enumerate live models for shutdown");
                return;
            }
        };

        let stops = live.iter().map(|model| async {
            if let Err(e) = self.stop(model.id).await {
                tracing::warn!(model_id = model.id, error = %e, "Failed to stop model during shutdown");
            }
        });
        futures::future::join_all(stops).await;
    }
}
