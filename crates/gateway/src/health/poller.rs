//! Periodic health poller.
//!
//! One scheduler loop owns the tick; probe work fans out through a bounded
//! worker pool so a slow upstream cannot starve the fast ones. The loop is
//! an explicit long-lived task holding a shutdown receiver; its lifecycle
//! bookends the gateway's.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};

use super::{HealthBoard, ProbeKind, ProbeOutcome};
use crate::config::HealthConfig;
use crate::store::{ModelState, Store};

/// Shared probe executor. Cloned into the admin refresh handler so a
/// one-shot probe of all urls reuses the same pool and client.
#[derive(Clone)]
pub struct ProbeRunner {
    board: Arc<HealthBoard>,
    client: reqwest::Client,
    timeout: Duration,
    pool: Arc<Semaphore>,
    internal_key: String,
}

impl ProbeRunner {
    pub fn new(board: Arc<HealthBoard>, client: reqwest::Client, cfg: &HealthConfig, internal_key: String) -> Self {
        Self {
            board,
            client,
            timeout: Duration::from_secs(cfg.probe_timeout_secs),
            pool: Arc::new(Semaphore::new(cfg.worker_pool_size)),
            internal_key,
        }
    }

    /// Probe every tracked url once, waiting for all results.
    pub async fn probe_all_once(&self) {
        let urls = self.board.tracked();
        if urls.is_empty() {
            return;
        }

        let mut tasks = Vec::with_capacity(urls.len());
        for (url, kind) in urls {
            let runner = self.clone();
            tasks.push(tokio::spawn(async move {
                // The permit bounds concurrent probe work.
                let Ok(_permit) = runner.pool.acquire().await else {
                    return;
                };
                runner.probe_one(&url, kind).await;
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Probe task panicked");
            }
        }
    }

    async fn probe_one(&self, url: &str, kind: ProbeKind) {
        let target = format!("{}{}", url.trim_end_matches('/'), kind.path());
        let started = Instant::now();

        let result = self
            .client
            .get(&target)
            .bearer_auth(&self.internal_key)
            .timeout(self.timeout)
            .send()
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let (ok, status_code, tokens_per_sec) = match result {
            Ok(response) => {
                let status = response.status();
                let tokens = if status.is_success() {
                    parse_tokens_per_sec(response).await
                } else {
                    None
                };
                (status.is_success(), Some(status.as_u16()), tokens)
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "Health probe failed");
                (false, e.status().map(|s| s.as_u16()), None)
            }
        };

        self.board
            .record_probe(
                url,
                ProbeOutcome {
                    ts: Utc::now(),
                    ok,
                    latency_ms,
                    status_code,
                },
                tokens_per_sec,
            )
            .await;
    }
}

/// Some engines report a throughput gauge alongside the probe body; keep it
/// for observability when present.
async fn parse_tokens_per_sec(response: reqwest::Response) -> Option<f64> {
    let body: serde_json::Value = response.json().await.ok()?;
    body.get("tokens_per_second")
        .or_else(|| body.get("tps"))
        .and_then(|v| v.as_f64())
}

pub struct HealthPoller {
    runner: ProbeRunner,
    store: Store,
    cfg: HealthConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthPoller {
    pub fn new(runner: ProbeRunner, store: Store, cfg: HealthConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            runner,
            store,
            cfg,
            shutdown_rx,
        }
    }

    /// Scheduler loop. The tick shortens while any model is loading so the
    /// first OK probe (and the promotion it triggers) lands quickly.
    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.cfg.probe_interval_secs,
            "Health poller started"
        );
        loop {
            let interval = if self.any_model_loading().await {
                Duration::from_secs(self.cfg.loading_probe_interval_secs)
            } else {
                Duration::from_secs(self.cfg.probe_interval_secs)
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.runner.probe_all_once().await;
                }
                _ = self.shutdown_rx.changed() => {
                    tracing::info!("Health poller stopping");
                    break;
                }
            }
        }
    }

    async fn any_model_loading(&self) -> bool {
        match self.store.live_models().await {
            Ok(models) => models.iter().any(|m| m.state == ModelState::Loading),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read live models for poll scheduling");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use httpmock::prelude::*;

    fn board() -> Arc<HealthBoard> {
        Arc::new(HealthBoard::new(
            HealthConfig {
                ttl_secs: 15,
                probe_interval_secs: 15,
                loading_probe_interval_secs: 3,
                probe_timeout_secs: 3,
                history_len: 10,
                worker_pool_size: 4,
            },
            BreakerConfig {
                enabled: false,
                open_threshold: 5,
                cooldown_secs: 30,
            },
        ))
    }

    fn runner(board: Arc<HealthBoard>) -> ProbeRunner {
        ProbeRunner::new(
            board,
            reqwest::Client::new(),
            &HealthConfig {
                ttl_secs: 15,
                probe_interval_secs: 15,
                loading_probe_interval_secs: 3,
                probe_timeout_secs: 3,
                history_len: 10,
                worker_pool_size: 4,
            },
            "internal".to_string(),
        )
    }

    #[tokio::test]
    async fn test_probe_marks_healthy_on_200() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).json_body(serde_json::json!({"status": "ok"}));
            })
            .await;

        let board = board();
        let url = format!("http://{}", server.address());
        board.track(&url, ProbeKind::HealthEndpoint);

        runner(board.clone()).probe_all_once().await;

        mock.assert_async().await;
        assert!(board.is_healthy(&url, Instant::now()).await);
    }

    #[tokio::test]
    async fn test_probe_uses_list_models_for_quantized() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/models");
                then.status(200)
                    .json_body(serde_json::json!({"object": "list", "data": []}));
            })
            .await;

        let board = board();
        let url = format!("http://{}", server.address());
        board.track(&url, ProbeKind::ListModels);

        runner(board.clone()).probe_all_once().await;

        mock.assert_async().await;
        assert!(board.is_healthy(&url, Instant::now()).await);
    }

    #[tokio::test]
    async fn test_probe_marks_unhealthy_on_500() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(500);
            })
            .await;

        let board = board();
        let url = format!("http://{}", server.address());
        board.track(&url, ProbeKind::HealthEndpoint);

        runner(board.clone()).probe_all_once().await;
        assert!(!board.is_healthy(&url, Instant::now()).await);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_marks_unhealthy() {
        let board = board();
        // Nothing listens here.
        let url = "http://127.0.0.1:9".to_string();
        board.track(&url, ProbeKind::HealthEndpoint);

        runner(board.clone()).probe_all_once().await;
        assert!(!board.is_healthy(&url, Instant::now()).await);
        assert!(!board.has_succeeded(&url).await);
    }

    #[tokio::test]
    async fn test_tokens_per_sec_recorded_when_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/models");
                then.status(200)
                    .json_body(serde_json::json!({"data": [], "tokens_per_second": 42.5}));
            })
            .await;

        let board = board();
        let url = format!("http://{}", server.address());
        board.track(&url, ProbeKind::ListModels);

        runner(board.clone()).probe_all_once().await;

        let (health, _) = board.snapshot().await;
        assert_eq!(health[&url]["tokens_per_sec"], 42.5);
    }
}
