//! Process-shared counter cache.
//!
//! Redis-backed when a URL is configured, so rate counters are shared
//! across horizontally scaled gateways; otherwise an in-process fallback
//! with the same interface keeps development deployments dependency-free.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub enum Cache {
    Redis(redis::aio::ConnectionManager),
    Memory(Arc<MemoryCounters>),
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cache::Redis(_) => write!(f, "Cache::Redis"),
            Cache::Memory(_) => write!(f, "Cache::Memory"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCounters {
    counters: DashMap<String, (i64, Instant)>,
}

impl MemoryCounters {
    fn incr_expire(&self, key: &str, ttl: Duration) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        let (count, expires_at) = *entry;
        if now >= expires_at {
            *entry = (1, now + ttl);
            1
        } else {
            *entry = (count + 1, expires_at);
            count + 1
        }
    }

    /// Drop expired windows so the map stays bounded.
    fn sweep(&self) {
        let now = Instant::now();
        self.counters.retain(|_, (_, expires_at)| now < *expires_at);
    }
}

impl Cache {
    /// Connect to redis, or fall back to process-local counters when no
    /// URL is configured.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        if redis_url.is_empty() {
            tracing::info!("No redis URL configured, using in-process rate counters");
            return Ok(Cache::Memory(Arc::new(MemoryCounters::default())));
        }

        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!("Connected to redis rate-counter cache");
        Ok(Cache::Redis(manager))
    }

    /// Atomically increment `key` and arm its expiry, returning the new
    /// count. The expiry is only set when the key is created, so the
    /// window does not slide on every hit.
    pub async fn incr_expire(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        match self {
            Cache::Redis(manager) => {
                let mut conn = manager.clone();
                let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
                if count == 1 {
                    let _: () = redis::cmd("EXPIRE")
                        .arg(key)
                        .arg(ttl.as_secs().max(1))
                        .query_async(&mut conn)
                        .await?;
                }
                Ok(count)
            }
            Cache::Memory(counters) => {
                if counters.counters.len() > 10_000 {
                    counters.sweep();
                }
                Ok(counters.incr_expire(key, ttl))
            }
        }
    }

    pub async fn get_i64(&self, key: &str) -> anyhow::Result<Option<i64>> {
        match self {
            Cache::Redis(manager) => {
                let mut conn = manager.clone();
                let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
                Ok(value)
            }
            Cache::Memory(counters) => Ok(counters.counters.get(key).and_then(|entry| {
                let (count, expires_at) = *entry;
                (Instant::now() < expires_at).then_some(count)
            })),
        }
    }

    /// The redis connection manager has no explicit close; dropping the
    /// last clone tears the connection down.
    pub fn close(&self) {
        if let Cache::Memory(counters) = self {
            counters.counters.clear();
        }
    }
}
