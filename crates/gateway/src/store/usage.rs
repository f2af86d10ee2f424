//! Append-only usage accounting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use super::{Store, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct UsageRow {
    pub request_id: String,
    pub identity_id: i64,
    pub served_name: String,
    pub task: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub latency_ms: i64,
    pub status: u16,
    pub started_at: DateTime<Utc>,
}

impl Store {
    pub async fn append_usage(&self, row: &UsageRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage \
             (request_id, identity_id, served_name, task, prompt_tokens, completion_tokens, \
              latency_ms, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&row.request_id)
        .bind(row.identity_id)
        .bind(&row.served_name)
        .bind(&row.task)
        .bind(row.prompt_tokens)
        .bind(row.completion_tokens)
        .bind(row.latency_ms)
        .bind(row.status as i64)
        .bind(row.started_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent_usage(&self, limit: u32) -> Result<Vec<UsageRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT request_id, identity_id, served_name, task, prompt_tokens, \
             completion_tokens, latency_ms, status, started_at \
             FROM usage ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(UsageRow {
                    request_id: row.try_get("request_id")?,
                    identity_id: row.try_get("identity_id")?,
                    served_name: row.try_get("served_name")?,
                    task: row.try_get("task")?,
                    prompt_tokens: row.try_get("prompt_tokens")?,
                    completion_tokens: row.try_get("completion_tokens")?,
                    latency_ms: row.try_get("latency_ms")?,
                    status: row.try_get::<i64, _>("status")? as u16,
                    started_at: row.try_get("started_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_list() {
        let store = Store::open_in_memory().await.unwrap();
        let row = UsageRow {
            request_id: "req-1".to_string(),
            identity_id: 7,
            served_name: "llama-3-8b".to_string(),
            task: "generate".to_string(),
            prompt_tokens: 12,
            completion_tokens: 40,
            latency_ms: 380,
            status: 200,
            started_at: Utc::now(),
        };
        store.append_usage(&row).await.unwrap();

        let rows = store.recent_usage(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].served_name, "llama-3-8b");
        assert_eq!(rows[0].status, 200);
        assert_eq!(rows[0].completion_tokens, 40);
    }
}
