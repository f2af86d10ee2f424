//! Rate and concurrency control.
//!
//! Two independent mechanisms applied after auth: a cache-backed request
//! rate limit per identity, and a process-wide semaphore bounding
//! concurrent streamed responses. Both default off.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cache::Cache;
use crate::config::LimitsConfig;
use crate::error::ApiError;
use crate::metrics::GatewayMetrics;
use crate::store::Identity;

pub struct RateLimiter {
    cache: Cache,
    cfg: LimitsConfig,
}

impl RateLimiter {
    pub fn new(cache: Cache, cfg: LimitsConfig) -> Self {
        Self { cache, cfg }
    }

    /// Effective (rps, burst) for an identity. Per-identity overrides
    /// replace the deployment defaults wholesale.
    fn effective_limits(&self, identity: &Identity) -> (u32, u32) {
        let rps = identity.rate_rps.unwrap_or(self.cfg.rate_rps);
        let burst = identity.rate_burst.unwrap_or(self.cfg.rate_burst.max(rps));
        (rps, burst)
    }

    /// Admit or refuse one request for this identity.
    pub async fn check(&self, identity: &Identity) -> Result<(), ApiError> {
        let (rps, burst) = self.effective_limits(identity);
        if rps == 0 {
            return Ok(());
        }

        let result = if self.cfg.sliding_window {
            self.check_sliding_window(identity.id, rps).await
        } else {
            self.check_bucket(identity.id, rps, burst.max(1)).await
        };

        match result {
            Ok(admitted) => admitted,
            Err(e) => {
                // A broken cache must not take the data plane down.
                tracing::error!(error = %e, "Rate-limit cache unavailable, admitting request");
                Ok(())
            }
        }
    }

    /// Token bucket approximated on a shared counter: `burst` tokens per
    /// refill window, window length sized so the sustained rate is `rps`.
    async fn check_bucket(
        &self,
        identity_id: i64,
        rps: u32,
        burst: u32,
    ) -> anyhow::Result<Result<(), ApiError>> {
        let window_secs = (burst as u64).div_ceil(rps as u64).max(1);
        let key = format!("cortex:rate:{identity_id}");
        let count = self
            .cache
            .incr_expire(&key, Duration::from_secs(window_secs))
            .await?;

        if count > burst as i64 {
            Ok(Err(ApiError::RateLimited {
                retry_after_secs: window_secs,
            }))
        } else {
            Ok(Ok(()))
        }
    }

    /// Sliding window: one counter per wall-clock second, summed over the
    /// configured window.
    async fn check_sliding_window(
        &self,
        identity_id: i64,
        rps: u32,
    ) -> anyhow::Result<Result<(), ApiError>> {
        let window = self.cfg.sliding_window_secs.max(1);
        let now_sec = chrono::Utc::now().timestamp();

        let current_key = format!("cortex:rate:{identity_id}:{now_sec}");
        // Buckets must outlive the window they are summed over.
        let mut total = self
            .cache
            .incr_expire(&current_key, Duration::from_secs(window + 1))
            .await?;

        for offset in 1..window {
            let key = format!("cortex:rate:{identity_id}:{}", now_sec - offset as i64);
            total += self.cache.get_i64(&key).await?.unwrap_or(0);
        }

        if total > (rps as i64) * (window as i64) {
            Ok(Err(ApiError::RateLimited { retry_after_secs: 1 }))
        } else {
            Ok(Ok(()))
        }
    }
}

/// Bounds concurrent streamed responses. The permit is held for the whole
/// stream and released on every exit path via `StreamPermit`'s drop.
pub struct StreamLimiter {
    semaphore: Option<Arc<Semaphore>>,
    metrics: Arc<GatewayMetrics>,
}

/// Scoped stream slot: releases the semaphore and the active-streams gauge
/// when dropped, including on client disconnect and deadline expiry.
pub struct StreamPermit {
    _permit: Option<OwnedSemaphorePermit>,
    metrics: Arc<GatewayMetrics>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.metrics.stream_finished();
    }
}

impl StreamLimiter {
    /// How long admission may wait for a slot before refusing.
    const ACQUIRE_GRACE: Duration = Duration::from_secs(10);

    pub fn new(cap: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            semaphore: (cap > 0).then(|| Arc::new(Semaphore::new(cap))),
            metrics,
        }
    }

    pub async fn acquire(&self) -> Result<StreamPermit, ApiError> {
        let permit = match &self.semaphore {
            None => None,
            Some(semaphore) => {
                let acquired = tokio::time::timeout(
                    Self::ACQUIRE_GRACE,
                    semaphore.clone().acquire_owned(),
                )
                .await;
                match acquired {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) | Err(_) => return Err(ApiError::ConcurrencyLimited),
                }
            }
        };

        self.metrics.stream_started();
        Ok(StreamPermit {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounters;
    use crate::store::Scope;

    fn identity(rps: Option<u32>, burst: Option<u32>) -> Identity {
        Identity {
            id: 1,
            name: "test".to_string(),
            scopes: vec![Scope::Chat],
            rate_rps: rps,
            rate_burst: burst,
        }
    }

    fn limiter(rate_rps: u32, rate_burst: u32) -> RateLimiter {
        RateLimiter::new(
            Cache::Memory(Arc::new(MemoryCounters::default())),
            LimitsConfig {
                rate_rps,
                rate_burst,
                sliding_window: false,
                sliding_window_secs: 10,
                streaming_cap: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = limiter(0, 0);
        let identity = identity(None, None);
        for _ in 0..100 {
            limiter.check(&identity).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bucket_refuses_beyond_burst() {
        let limiter = limiter(5, 5);
        let identity = identity(None, None);

        for _ in 0..5 {
            limiter.check(&identity).await.unwrap();
        }
        let err = limiter.check(&identity).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_identity_override_replaces_defaults() {
        let limiter = limiter(100, 100);
        let restricted = identity(Some(2), Some(2));

        limiter.check(&restricted).await.unwrap();
        limiter.check(&restricted).await.unwrap();
        assert!(limiter.check(&restricted).await.is_err());
    }

    #[tokio::test]
    async fn test_refusal_carries_retry_after() {
        let limiter = limiter(1, 3);
        let identity = identity(None, None);
        for _ in 0..3 {
            limiter.check(&identity).await.unwrap();
        }
        match limiter.check(&identity).await.unwrap_err() {
            ApiError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identities_limited_independently() {
        let limiter = limiter(2, 2);
        let a = identity(None, None);
        let b = Identity { id: 2, ..identity(None, None) };

        limiter.check(&a).await.unwrap();
        limiter.check(&a).await.unwrap();
        assert!(limiter.check(&a).await.is_err());
        limiter.check(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_sliding_window_counts_recent_seconds() {
        let limiter = RateLimiter::new(
            Cache::Memory(Arc::new(MemoryCounters::default())),
            LimitsConfig {
                rate_rps: 1,
                rate_burst: 1,
                sliding_window: true,
                sliding_window_secs: 5,
                streaming_cap: 0,
            },
        );
        let identity = identity(None, None);

        // 1 rps over a 5 s window: 5 admits, then refusal.
        for _ in 0..5 {
            limiter.check(&identity).await.unwrap();
        }
        assert!(limiter.check(&identity).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_limiter_caps_and_releases() {
        let metrics = Arc::new(GatewayMetrics::new());
        let limiter = StreamLimiter::new(2, metrics.clone());

        let p1 = limiter.acquire().await.unwrap();
        let _p2 = limiter.acquire().await.unwrap();
        assert_eq!(metrics.streams_active(), 2);

        drop(p1);
        assert_eq!(metrics.streams_active(), 1);
        let _p3 = limiter.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_uncapped_stream_limiter_still_counts() {
        let metrics = Arc::new(GatewayMetrics::new());
        let limiter = StreamLimiter::new(0, metrics.clone());
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(metrics.streams_active(), 1);
        drop(permit);
        assert_eq!(metrics.streams_active(), 0);
    }
}
