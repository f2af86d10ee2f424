//! Shared application state.
//!
//! All long-lived resources are owned here and injected into components
//! via constructors; the shutdown coordinator is the sole closer. A watch
//! channel fans the termination signal out to the background tasks.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use runtime::docker::DockerClient;

use crate::balancer::LoadBalancer;
use crate::cache::Cache;
use crate::config::GatewayConfig;
use crate::health::poller::{HealthPoller, ProbeRunner};
use crate::health::{HealthBoard, ProbeKind};
use crate::lifecycle::reconcile::{orphan_sweep, Reconciler};
use crate::lifecycle::{probe_kind_for, LifecycleManager, ModelDriver};
use crate::limits::{RateLimiter, StreamLimiter};
use crate::metrics::GatewayMetrics;
use crate::registry::UpstreamRegistry;
use crate::store::{Scope, Store};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Store,
    pub cache: Cache,
    pub driver: Arc<dyn ModelDriver>,
    pub registry: Arc<UpstreamRegistry>,
    pub health: Arc<HealthBoard>,
    pub probe_runner: ProbeRunner,
    pub balancer: Arc<LoadBalancer>,
    pub rate: Arc<RateLimiter>,
    pub streams: Arc<StreamLimiter>,
    pub metrics: Arc<GatewayMetrics>,
    pub lifecycle: Arc<LifecycleManager>,
    pub http: reqwest::Client,
    pub shutdown_tx: Arc<watch::Sender<bool>>,
    draining: Arc<AtomicBool>,
    pub in_flight: Arc<AtomicI64>,
}

impl AppState {
    /// Build production state: real store, cache, and Docker driver.
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let store = Store::open(&config.store.database_path).await?;
        let cache = Cache::connect(&config.cache.redis_url).await?;
        let docker = DockerClient::new(&config.models.docker_socket)?;
        Ok(Self::with_parts(config, store, cache, Arc::new(docker)))
    }

    /// Wire every component from already-built resources.
    pub fn with_parts(
        config: GatewayConfig,
        store: Store,
        cache: Cache,
        driver: Arc<dyn ModelDriver>,
    ) -> Self {
        let http = reqwest::Client::new();
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(UpstreamRegistry::new(store.clone()));
        let health = Arc::new(HealthBoard::new(
            config.health.clone(),
            config.breaker.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), health.clone()));
        let rate = Arc::new(RateLimiter::new(cache.clone(), config.limits.clone()));
        let streams = Arc::new(StreamLimiter::new(
            config.limits.streaming_cap,
            metrics.clone(),
        ));
        let probe_runner = ProbeRunner::new(
            health.clone(),
            http.clone(),
            &config.health,
            config.auth.upstream_internal_key.clone(),
        );
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            driver.clone(),
            registry.clone(),
            health.clone(),
            config.models.clone(),
            config.auth.upstream_internal_key.clone(),
            http.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            store,
            cache,
            driver,
            registry,
            health,
            probe_runner,
            balancer,
            rate,
            streams,
            metrics,
            lifecycle,
            http,
            shutdown_tx: Arc::new(shutdown_tx),
            draining: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Restore persisted routing state, sweep orphans, start the owned
    /// background tasks.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        tracing::info!("Initializing application state...");

        self.seed_bootstrap_key().await?;

        let restored = self.registry.restore().await?;
        if restored > 0 {
            tracing::info!(entries = restored, "Restored registry snapshot");
        }

        // Re-derive precise probe kinds for urls owned by live models;
        // anything else restored from the snapshot falls back to the
        // list-models probe, which both engines answer.
        for model in self.store.live_models().await? {
            if let Some(url) = LifecycleManager::upstream_url(&model) {
                self.health.track(&url, probe_kind_for(model.engine));
            }
        }
        for url in self.registry.urls() {
            self.health.track(&url, ProbeKind::ListModels);
        }

        let removed = orphan_sweep(&self.store, &self.driver).await;
        if removed > 0 {
            tracing::info!(removed, "Orphan cleanup complete");
        }

        let poller = HealthPoller::new(
            self.probe_runner.clone(),
            self.store.clone(),
            self.config.health.clone(),
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(poller.run());

        let reconciler = Reconciler::new(
            self.store.clone(),
            self.driver.clone(),
            self.registry.clone(),
            self.health.clone(),
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(reconciler.run());

        tracing::info!("Application state initialized");
        Ok(())
    }

    /// Seed the configured bootstrap credential so a fresh deployment has
    /// one working all-scope key. Idempotent across restarts.
    async fn seed_bootstrap_key(&self) -> anyhow::Result<()> {
        let key = &self.config.auth.bootstrap_key;
        if key.is_empty() {
            return Ok(());
        }
        if self.store.find_identity_by_token(key).await?.is_some() {
            return Ok(());
        }

        let identity_id = self.store.create_identity("bootstrap", None, None).await?;
        self.store
            .create_api_key(
                identity_id,
                key,
                &[Scope::Chat, Scope::Completions, Scope::Embeddings],
            )
            .await?;
        tracing::info!("Seeded bootstrap API key");
        Ok(())
    }

    /// Flip the gateway into draining mode and signal background tasks.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_key_seeded_idempotently() {
        let mut config = GatewayConfig::default();
        config.auth.bootstrap_key = "sk-bootstrap".to_string();
        let (state, _) = test_support::state_with(config).await;

        state.seed_bootstrap_key().await.unwrap();
        state.seed_bootstrap_key().await.unwrap();

        let identity = state
            .store
            .find_identity_by_token("sk-bootstrap")
            .await
            .unwrap()
            .expect("bootstrap identity");
        assert_eq!(identity.name, "bootstrap");
        assert!(identity.has_scope(Scope::Embeddings));
    }

    #[tokio::test]
    async fn test_empty_bootstrap_key_seeds_nothing() {
        let (state, _) = test_support::state().await;
        state.seed_bootstrap_key().await.unwrap();
        assert!(state
            .store
            .find_identity_by_token("")
            .await
            .unwrap()
            .is_none());
    }
}

#[cfg(test)]
pub mod test_support {
    //! Fully wired state over in-memory store, memory cache, and the fake
    //! container driver.

    use super::*;
    use crate::cache::MemoryCounters;
    use crate::lifecycle::driver::fake::FakeDriver;

    pub async fn state_with(config: GatewayConfig) -> (AppState, Arc<FakeDriver>) {
        let store = Store::open_in_memory().await.unwrap();
        let cache = Cache::Memory(Arc::new(MemoryCounters::default()));
        let driver = Arc::new(FakeDriver::with_images(&[
            "vllm/vllm-openai:latest",
            "ghcr.io/ggml-org/llama.cpp:server",
        ]));
        let state = AppState::with_parts(config, store, cache, driver.clone());
        (state, driver)
    }

    pub async fn state() -> (AppState, Arc<FakeDriver>) {
        state_with(GatewayConfig::default()).await
    }
}
