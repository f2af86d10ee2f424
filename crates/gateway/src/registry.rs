//! Upstream registry: served name to pool of upstream entries.
//!
//! The lifecycle manager owns all mutations. Every mutation is
//! write-through: the call returns only after the snapshot reached the
//! store's key/value area, so a cold gateway reboots with the correct
//! routing map.

use parking_lot::Mutex;
use runtime::engines::ModelTask;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::store::Store;

/// Key the snapshot is persisted under in `config_kv`.
pub const REGISTRY_SNAPSHOT_KEY: &str = "model_registry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEntry {
    pub url: String,
    pub task: ModelTask,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("served name '{served_name}' already serves task '{existing}'")]
    TaskMixing {
        served_name: String,
        existing: ModelTask,
    },
}

pub struct UpstreamRegistry {
    entries: Mutex<HashMap<String, Vec<UpstreamEntry>>>,
    store: Store,
}

impl UpstreamRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Add a url to the pool for `served_name`. All entries of one pool
    /// must carry the same task; registering the same url twice is a no-op.
    pub async fn register(
        &self,
        served_name: &str,
        url: &str,
        task: ModelTask,
    ) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get(served_name).and_then(|pool| pool.first()) {
                if existing.task != task {
                    return Err(RegistryError::TaskMixing {
                        served_name: served_name.to_string(),
                        existing: existing.task,
                    });
                }
            }
            let pool = entries.entry(served_name.to_string()).or_default();
            if !pool.iter().any(|e| e.url == url) {
                pool.push(UpstreamEntry {
                    url: url.to_string(),
                    task,
                });
            }
        }

        tracing::info!(served_name, url, %task, "Registered upstream");
        self.persist_snapshot().await;
        Ok(())
    }

    /// Remove a url from every pool containing it; empty pools are dropped.
    pub async fn unregister(&self, url: &str) {
        let mut removed_from = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|name, pool| {
                let before = pool.len();
                pool.retain(|e| e.url != url);
                if pool.len() != before {
                    removed_from.push(name.clone());
                }
                !pool.is_empty()
            });
        }

        if !removed_from.is_empty() {
            tracing::info!(url, pools = ?removed_from, "Unregistered upstream");
        }
        self.persist_snapshot().await;
    }

    /// The pool for one served name.
    pub fn lookup(&self, served_name: &str) -> Option<Vec<UpstreamEntry>> {
        self.entries.lock().get(served_name).cloned()
    }

    pub fn served_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// All distinct urls currently registered.
    pub fn urls(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut urls: Vec<String> = entries
            .values()
            .flat_map(|pool| pool.iter().map(|e| e.url.clone()))
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    pub fn as_map(&self) -> HashMap<String, Vec<UpstreamEntry>> {
        self.entries.lock().clone()
    }

    /// Replace in-memory state from the persisted snapshot, if one exists.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(value) = self.store.kv_get(REGISTRY_SNAPSHOT_KEY).await? else {
            return Ok(0);
        };
        let map: HashMap<String, Vec<UpstreamEntry>> = serde_json::from_value(value)?;
        let count = map.values().map(|p| p.len()).sum();
        *self.entries.lock() = map;
        Ok(count)
    }

    /// Write the snapshot. Persistence failures are logged, never surfaced:
    /// routing keeps working from memory, only restart recovery degrades.
    async fn persist_snapshot(&self) {
        let map = self.as_map();
        let value = match serde_json::to_value(&map) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize registry snapshot");
                return;
            }
        };
        if let Err(e) = self.store.kv_set(REGISTRY_SNAPSHOT_KEY, &value).await {
            tracing::error!(error = %e, "Failed to persist registry snapshot");
        }
    }
}
