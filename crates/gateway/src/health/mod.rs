//! Per-upstream health records.
//!
//! One async mutex per url guards the probe history, the current verdict,
//! and the breaker. Probe writers and the balancer's readers meet here;
//! critical sections stay short and never span network I/O.

pub mod poller;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::breaker::{Breaker, Outcome};
use crate::config::{BreakerConfig, HealthConfig};

/// How an upstream is probed. The transformer engine exposes a dedicated
/// health endpoint; the quantized engine is probed via its model listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    HealthEndpoint,
    ListModels,
}

impl ProbeKind {
    pub fn path(self) -> &'static str {
        match self {
            ProbeKind::HealthEndpoint => "/health",
            ProbeKind::ListModels => "/v1/models",
        }
    }
}

/// One probe result in the rolling history.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ts: DateTime<Utc>,
    pub ok: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub ok: bool,
    pub expires_at: Instant,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HealthState {
    pub probe_kind: ProbeKind,
    pub history: VecDeque<ProbeOutcome>,
    pub verdict: Option<Verdict>,
    pub breaker: Breaker,
    /// Engine-reported throughput gauge, when the probe body carries one.
    pub tokens_per_sec: Option<f64>,
}

pub struct HealthBoard {
    states: DashMap<String, Arc<Mutex<HealthState>>>,
    health_cfg: HealthConfig,
    breaker_cfg: BreakerConfig,
}

impl HealthBoard {
    pub fn new(health_cfg: HealthConfig, breaker_cfg: BreakerConfig) -> Self {
        Self {
            states: DashMap::new(),
            health_cfg,
            breaker_cfg,
        }
    }

    /// Begin tracking a url. Idempotent; an existing record is kept so a
    /// re-registration does not erase history.
    pub fn track(&self, url: &str, probe_kind: ProbeKind) {
        self.states.entry(url.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(HealthState {
                probe_kind,
                history: VecDeque::with_capacity(self.health_cfg.history_len),
                verdict: None,
                breaker: Breaker::new(
                    self.breaker_cfg.enabled,
                    self.breaker_cfg.open_threshold,
                    Duration::from_secs(self.breaker_cfg.cooldown_secs),
                ),
                tokens_per_sec: None,
            }))
        });
    }

    /// Stop tracking a url. Any in-flight probe result for it is discarded
    /// on arrival because the record is gone.
    pub fn untrack(&self, url: &str) {
        self.states.remove(url);
    }

    pub fn tracked(&self) -> Vec<(String, ProbeKind)> {
        let mut urls = Vec::new();
        for entry in self.states.iter() {
            let kind = entry
                .value()
                .try_lock()
                .map(|s| s.probe_kind)
                .unwrap_or(ProbeKind::ListModels);
            urls.push((entry.key().clone(), kind));
        }
        urls.sort_by(|a, b| a.0.cmp(&b.0));
        urls
    }

    fn get(&self, url: &str) -> Option<Arc<Mutex<HealthState>>> {
        self.states.get(url).map(|entry| entry.value().clone())
    }

    /// Record one probe outcome: history, verdict, breaker.
    pub async fn record_probe(&self, url: &str, outcome: ProbeOutcome, tokens_per_sec: Option<f64>) {
        let Some(state) = self.get(url) else {
            tracing::debug!(url, "Discarding probe result for untracked url");
            return;
        };
        let mut state = state.lock().await;

        let now = Instant::now();
        state.verdict = Some(Verdict {
            ok: outcome.ok,
            expires_at: now + Duration::from_secs(self.health_cfg.ttl_secs),
            checked_at: outcome.ts,
        });
        state.breaker.on_outcome(
            if outcome.ok { Outcome::Success } else { Outcome::Failure },
            now,
        );
        if tokens_per_sec.is_some() {
            state.tokens_per_sec = tokens_per_sec;
        }

        if state.history.len() >= self.health_cfg.history_len {
            state.history.pop_front();
        }
        state.history.push_back(outcome);
    }

    /// Breaker feedback from proxied requests, outside the poller.
    pub async fn record_request_outcome(&self, url: &str, success: bool) {
        let Some(state) = self.get(url) else { return };
        let mut state = state.lock().await;
        state.breaker.on_outcome(
            if success { Outcome::Success } else { Outcome::Failure },
            Instant::now(),
        );
    }

    /// The balancer's healthy test: verdict ok, unexpired, breaker closed.
    pub async fn is_healthy(&self, url: &str, now: Instant) -> bool {
        let Some(state) = self.get(url) else {
            return false;
        };
        let state = state.lock().await;
        if state.breaker.is_open(now) {
            return false;
        }
        match &state.verdict {
            Some(v) => v.ok && now < v.expires_at,
            None => false,
        }
    }

    /// Whether the url has ever produced a successful probe. Used by the
    /// reconciler to promote a loading model.
    pub async fn has_succeeded(&self, url: &str) -> bool {
        let Some(state) = self.get(url) else {
            return false;
        };
        let state = state.lock().await;
        state.history.iter().any(|p| p.ok)
    }

    /// Admin introspection: health and breaker state per url.
    pub async fn snapshot(&self) -> (serde_json::Value, serde_json::Value) {
        let now = Instant::now();
        let mut health = serde_json::Map::new();
        let mut breakers = serde_json::Map::new();

        for (url, _) in self.tracked() {
            let Some(state) = self.get(&url) else { continue };
            let state = state.lock().await;

            let verdict = state.verdict.as_ref().map(|v| {
                serde_json::json!({
                    "ok": v.ok,
                    "checked_at": v.checked_at.to_rfc3339(),
                    "expires_in_secs": v.expires_at.saturating_duration_since(now).as_secs(),
                })
            });
            let recent: Vec<serde_json::Value> = state
                .history
                .iter()
                .rev()
                .take(10)
                .map(|p| {
                    serde_json::json!({
                        "ts": p.ts.to_rfc3339(),
                        "ok": p.ok,
                        "latency_ms": p.latency_ms,
                        "status_code": p.status_code,
                    })
                })
                .collect();

            health.insert(
                url.clone(),
                serde_json::json!({
                    "verdict": verdict,
                    "recent_probes": recent,
                    "tokens_per_sec": state.tokens_per_sec,
                }),
            );
            breakers.insert(url.clone(), state.breaker.describe(now));
        }

        (health.into(), breakers.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> HealthBoard {
        let breaker = BreakerConfig {
            enabled: true,
            open_threshold: 3,
            cooldown_secs: 30,
        };
        HealthBoard::new(
            HealthConfig {
                ttl_secs: 15,
                probe_interval_secs: 15,
                loading_probe_interval_secs: 3,
                probe_timeout_secs: 3,
                history_len: 5,
                worker_pool_size: 4,
            },
            breaker,
        )
    }

    fn ok_probe() -> ProbeOutcome {
        ProbeOutcome {
            ts: Utc::now(),
            ok: true,
            latency_ms: 12,
            status_code: Some(200),
        }
    }

    fn failed_probe() -> ProbeOutcome {
        ProbeOutcome {
            ts: Utc::now(),
            ok: false,
            latency_ms: 3000,
            status_code: None,
        }
    }

    #[tokio::test]
    async fn test_untracked_url_is_unhealthy() {
        let board = board();
        assert!(!board.is_healthy("http://a:1", Instant::now()).await);
    }

    #[tokio::test]
    async fn test_ok_probe_yields_healthy_verdict() {
        let board = board();
        board.track("http://a:1", ProbeKind::HealthEndpoint);
        board.record_probe("http://a:1", ok_probe(), None).await;
        assert!(board.is_healthy("http://a:1", Instant::now()).await);
    }

    #[tokio::test]
    async fn test_verdict_expires_after_ttl() {
        let board = board();
        board.track("http://a:1", ProbeKind::HealthEndpoint);
        board.record_probe("http://a:1", ok_probe(), None).await;

        let after_ttl = Instant::now() + Duration::from_secs(16);
        assert!(!board.is_healthy("http://a:1", after_ttl).await);
    }

    #[tokio::test]
    async fn test_breaker_opens_on_request_failures() {
        let board = board();
        board.track("http://a:1", ProbeKind::ListModels);
        board.record_probe("http://a:1", ok_probe(), None).await;

        for _ in 0..3 {
            board.record_request_outcome("http://a:1", false).await;
        }
        // Verdict still fresh and ok, but the breaker withholds the url.
        assert!(!board.is_healthy("http://a:1", Instant::now()).await);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let board = board();
        board.track("http://a:1", ProbeKind::ListModels);
        for _ in 0..12 {
            board.record_probe("http://a:1", ok_probe(), None).await;
        }
        let state = board.get("http://a:1").unwrap();
        assert_eq!(state.lock().await.history.len(), 5);
    }

    #[tokio::test]
    async fn test_probe_for_untracked_url_is_discarded() {
        let board = board();
        board.track("http://a:1", ProbeKind::ListModels);
        board.untrack("http://a:1");
        board.record_probe("http://a:1", ok_probe(), None).await;
        assert!(!board.is_healthy("http://a:1", Instant::now()).await);
    }

    #[tokio::test]
    async fn test_has_succeeded_sees_any_ok_in_history() {
        let board = board();
        board.track("http://a:1", ProbeKind::ListModels);
        board.record_probe("http://a:1", failed_probe(), None).await;
        assert!(!board.has_succeeded("http://a:1").await);

        board.record_probe("http://a:1", ok_probe(), None).await;
        board.record_probe("http://a:1", failed_probe(), None).await;
        assert!(board.has_succeeded("http://a:1").await);
    }
}
