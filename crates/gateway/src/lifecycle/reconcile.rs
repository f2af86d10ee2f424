//! Reconciler: observed container state vs declared model state.
//!
//! A periodic tick promotes starting -> loading once the container runs,
//! loading -> running on the first successful probe, and lands any model
//! whose container died in `failed` with a structured reason. The boot
//! orphan sweep covers the crash path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use runtime::docker::ContainerRunState;

use super::{probe_kind_for, LifecycleManager, ModelDriver};
use crate::health::HealthBoard;
use crate::registry::UpstreamRegistry;
use crate::store::model::CONTAINER_NAME_PREFIX;
use crate::store::{ModelRecord, ModelState, Store};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// How many log lines feed the stored failure reason.
const FAILURE_LOG_TAIL: u32 = 20;

pub struct Reconciler {
    store: Store,
    driver: Arc<dyn ModelDriver>,
    registry: Arc<UpstreamRegistry>,
    health: Arc<HealthBoard>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        store: Store,
        driver: Arc<dyn ModelDriver>,
        registry: Arc<UpstreamRegistry>,
        health: Arc<HealthBoard>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            driver,
            registry,
            health,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {
                    self.tick().await;
                }
                _ = self.shutdown_rx.changed() => {
                    tracing::info!("Reconciler stopping");
                    break;
                }
            }
        }
    }

    /// One reconcile pass over every live model.
    pub async fn tick(&self) {
        let live = match self.store.live_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::error!(error = %e, "Reconciler failed to list live models");
                return;
            }
        };

        for model in live {
            if let Err(e) = self.reconcile_one(&model).await {
                tracing::error!(model_id = model.id, error = %e, "Reconcile failed");
            }
        }
    }

    async fn reconcile_one(&self, model: &ModelRecord) -> Result<(), crate::error::ApiError> {
        let name = model.expected_container_name();
        let observed = self
            .driver
            .run_state(&name)
            .await
            .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;

        match (model.state, observed) {
            (ModelState::Starting, ContainerRunState::Running) => {
                tracing::info!(model_id = model.id, "Container up, model loading");
                self.store
                    .set_model_state(model.id, ModelState::Loading, None)
                    .await?;
                // Ensure the tentative registration survived a gateway
                // restart between start and now.
                if let Some(url) = LifecycleManager::upstream_url(model) {
                    self.health.track(&url, probe_kind_for(model.engine));
                }
            }
            (ModelState::Loading, ContainerRunState::Running) => {
                if let Some(url) = LifecycleManager::upstream_url(model) {
                    if self.health.has_succeeded(&url).await {
                        tracing::info!(
                            model_id = model.id,
                            served_name = %model.served_name,
                            "First successful probe, model running"
                        );
                        self.store
                            .set_model_state(model.id, ModelState::Running, None)
                            .await?;
                    }
                }
            }
            (_, ContainerRunState::Exited { code }) => {
                self.fail_model(model, &name, Some(code)).await?;
            }
            (_, ContainerRunState::Gone) => {
                self.fail_model(model, &name, None).await?;
            }
            // Running with a running container, or starting with a
            // still-created container: nothing to do.
            _ => {}
        }
        Ok(())
    }

    /// Container death: capture a reason, clean routing, land in `failed`.
    async fn fail_model(
        &self,
        model: &ModelRecord,
        container_name: &str,
        exit_code: Option<i64>,
    ) -> Result<(), crate::error::ApiError> {
        let tail = self
            .driver
            .log_tail(container_name, FAILURE_LOG_TAIL)
            .await
            .unwrap_or_default();
        let reason = match exit_code {
            Some(code) => {
                let snippet = tail.lines().last().unwrap_or("").trim();
                if snippet.is_empty() {
                    format!("container exited with code {code}")
                } else {
                    format!("container exited with code {code}: {snippet}")
                }
            }
            None => "container disappeared".to_string(),
        };
        tracing::warn!(model_id = model.id, served_name = %model.served_name, reason, "Model failed");

        if let Some(url) = LifecycleManager::upstream_url(model) {
            self.registry.unregister(&url).await;
            self.health.untrack(&url);
        }
        let _ = self.driver.remove_container(container_name, true).await;

        self.store.clear_model_runtime(model.id).await?;
        self.store
            .set_model_state(model.id, ModelState::Failed, Some(&reason))
            .await?;
        Ok(())
    }
}

/// Boot-time orphan sweep: stop and remove any container matching the
/// naming pattern that no live model claims.
pub async fn orphan_sweep(store: &Store, driver: &Arc<dyn ModelDriver>) -> usize {
    let claimed: std::collections::HashSet<String> = match store.live_models().await {
        Ok(models) => models.iter().map(|m| m.expected_container_name()).collect(),
        Err(e) => {
            tracing::error!(error = %e, "Orphan sweep could not list live models");
            return 0;
        }
    };

    let containers = match driver.list_prefixed_containers(CONTAINER_NAME_PREFIX).await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::error!(error = %e, "Orphan sweep could not list containers");
            return 0;
        }
    };

    let mut removed = 0;
    for container in containers {
        if claimed.contains(&container.name) {
            continue;
        }
        tracing::warn!(container = %container.name, "Orphan cleanup: removing unclaimed container");
        if container.running {
            if let Err(e) = driver.stop_container(&container.id, 5).await {
                tracing::warn!(container = %container.name, error = %e, "Orphan stop failed");
            }
        }
        match driver.remove_container(&container.id, true).await {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(container = %container.name, error = %e, "Orphan removal failed")
            }
        }
    }
    removed
}
