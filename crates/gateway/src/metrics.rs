//! Gateway counters exposed on /metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    auth_rejected: AtomicU64,
    rate_limited: AtomicU64,
    streams_total: AtomicU64,
    streams_active: AtomicI64,
    upstream_retries: AtomicU64,
    usage_write_failures: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_rejected(&self) {
        self.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_started(&self) {
        self.streams_total.fetch_add(1, Ordering::Relaxed);
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self) {
        self.streams_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_upstream_retry(&self) {
        self.upstream_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage_write_failure(&self) {
        self.usage_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn streams_active(&self) -> i64 {
        self.streams_active.load(Ordering::Relaxed)
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "failed": self.requests_failed.load(Ordering::Relaxed),
                "auth_rejected": self.auth_rejected.load(Ordering::Relaxed),
                "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            },
            "streams": {
                "total": self.streams_total.load(Ordering::Relaxed),
                "active": self.streams_active.load(Ordering::Relaxed),
            },
            "upstream": {
                "retries": self.upstream_retries.load(Ordering::Relaxed),
            },
            "usage": {
                "write_failures": self.usage_write_failures.load(Ordering::Relaxed),
            },
        })
    }
}
