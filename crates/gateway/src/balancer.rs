//! Load balancer: served name to upstream url.
//!
//! Strict round robin over the healthy partition; when nothing is healthy
//! it degrades to round robin over the full pool, preferring to try rather
//! than refuse. Cursors are per served name and in-memory only.

use dashmap::DashMap;
use runtime::engines::ModelTask;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::health::HealthBoard;
use crate::registry::UpstreamRegistry;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("no upstream registered")]
    NoUpstream,
    #[error("task mismatch: pool serves '{actual}', requested '{requested}'")]
    TaskMismatch {
        requested: ModelTask,
        actual: ModelTask,
    },
}

pub struct LoadBalancer {
    registry: Arc<UpstreamRegistry>,
    health: Arc<HealthBoard>,
    cursors: DashMap<String, Arc<AtomicUsize>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<UpstreamRegistry>, health: Arc<HealthBoard>) -> Self {
        Self {
            registry,
            health,
            cursors: DashMap::new(),
        }
    }

    /// Pick an upstream for one request.
    pub async fn choose(&self, served_name: &str, task: ModelTask) -> Result<String, RouteError> {
        let Some(pool) = self.registry.lookup(served_name) else {
            return Err(RouteError::NoUpstream);
        };
        if pool.is_empty() {
            return Err(RouteError::NoUpstream);
        }
        if let Some(entry) = pool.first() {
            if entry.task != task {
                return Err(RouteError::TaskMismatch {
                    requested: task,
                    actual: entry.task,
                });
            }
        }

        let now = Instant::now();
        let mut healthy = Vec::with_capacity(pool.len());
        for entry in &pool {
            if self.health.is_healthy(&entry.url, now).await {
                healthy.push(entry.url.clone());
            }
        }

        let candidates: Vec<String> = if healthy.is_empty() {
            tracing::debug!(served_name, "No healthy upstream, degrading to full pool");
            pool.into_iter().map(|e| e.url).collect()
        } else {
            healthy
        };

        let cursor = self
            .cursors
            .entry(served_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        let index = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, HealthConfig};
    use crate::health::{ProbeKind, ProbeOutcome};
    use crate::store::Store;
    use chrono::Utc;
    use std::collections::HashMap;

    fn health_cfg() -> HealthConfig {
        HealthConfig {
            ttl_secs: 15,
            probe_interval_secs: 15,
            loading_probe_interval_secs: 3,
            probe_timeout_secs: 3,
            history_len: 10,
            worker_pool_size: 4,
        }
    }

    fn breaker_cfg(enabled: bool) -> BreakerConfig {
        BreakerConfig {
            enabled,
            open_threshold: 3,
            cooldown_secs: 30,
        }
    }

    async fn setup(enabled_breaker: bool) -> (Arc<UpstreamRegistry>, Arc<HealthBoard>, LoadBalancer)
    {
        let registry = Arc::new(UpstreamRegistry::new(Store::open_in_memory().await.unwrap()));
        let health = Arc::new(HealthBoard::new(health_cfg(), breaker_cfg(enabled_breaker)));
        let balancer = LoadBalancer::new(registry.clone(), health.clone());
        (registry, health, balancer)
    }

    async fn mark_ok(health: &HealthBoard, url: &str) {
        health.track(url, ProbeKind::HealthEndpoint);
        health
            .record_probe(
                url,
                ProbeOutcome {
                    ts: Utc::now(),
                    ok: true,
                    latency_ms: 5,
                    status_code: Some(200),
                },
                None,
            )
            .await;
    }

    #[tokio::test]
    async fn test_absent_name_is_no_upstream() {
        let (_, _, balancer) = setup(false).await;
        assert_eq!(
            balancer.choose("nope", ModelTask::Generate).await,
            Err(RouteError::NoUpstream)
        );
    }

    #[tokio::test]
    async fn test_task_mismatch_rejected() {
        let (registry, health, balancer) = setup(false).await;
        registry
            .register("embedder", "http://a:1", ModelTask::Embed)
            .await
            .unwrap();
        mark_ok(&health, "http://a:1").await;

        assert!(matches!(
            balancer.choose("embedder", ModelTask::Generate).await,
            Err(RouteError::TaskMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_round_robin_fairness_over_healthy_pool() {
        let (registry, health, balancer) = setup(false).await;
        for url in ["http://a:1", "http://b:2", "http://c:3"] {
            registry
                .register("llama", url, ModelTask::Generate)
                .await
                .unwrap();
            mark_ok(&health, url).await;
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let url = balancer.choose("llama", ModelTask::Generate).await.unwrap();
            *counts.entry(url).or_default() += 1;
        }

        // 30 calls over 3 healthy urls: exactly 10 each.
        assert_eq!(counts.len(), 3);
        for (_, count) in counts {
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn test_unhealthy_urls_excluded_while_any_healthy() {
        let (registry, health, balancer) = setup(false).await;
        registry
            .register("llama", "http://good:1", ModelTask::Generate)
            .await
            .unwrap();
        registry
            .register("llama", "http://bad:2", ModelTask::Generate)
            .await
            .unwrap();
        mark_ok(&health, "http://good:1").await;
        health.track("http://bad:2", ProbeKind::HealthEndpoint);

        for _ in 0..8 {
            let url = balancer.choose("llama", ModelTask::Generate).await.unwrap();
            assert_eq!(url, "http://good:1");
        }
    }

    #[tokio::test]
    async fn test_degraded_mode_tries_full_pool() {
        let (registry, _, balancer) = setup(false).await;
        registry
            .register("llama", "http://a:1", ModelTask::Generate)
            .await
            .unwrap();
        registry
            .register("llama", "http://b:2", ModelTask::Generate)
            .await
            .unwrap();

        // No health records at all: degraded round robin over everything.
        let first = balancer.choose("llama", ModelTask::Generate).await.unwrap();
        let second = balancer.choose("llama", ModelTask::Generate).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_open_breaker_excludes_url_from_healthy_partition() {
        let (registry, health, balancer) = setup(true).await;
        registry
            .register("llama", "http://a:1", ModelTask::Generate)
            .await
            .unwrap();
        registry
            .register("llama", "http://b:2", ModelTask::Generate)
            .await
            .unwrap();
        mark_ok(&health, "http://a:1").await;
        mark_ok(&health, "http://b:2").await;

        // Trip the breaker on b.
        for _ in 0..3 {
            health.record_request_outcome("http://b:2", false).await;
        }

        for _ in 0..6 {
            let url = balancer.choose("llama", ModelTask::Generate).await.unwrap();
            assert_eq!(url, "http://a:1");
        }
    }
}
