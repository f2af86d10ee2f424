//! Opaque key/value configuration area. The registry snapshot lives here.

use chrono::Utc;
use sqlx::Row;

use super::{Store, StoreError};

impl Store {
    pub async fn kv_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM config_kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("bad kv value for '{key}': {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn kv_set(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO config_kv (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&raw)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_overwrite() {
        let store = Store::open_in_memory().await.unwrap();

        assert!(store.kv_get("missing").await.unwrap().is_none());

        store.kv_set("k", &json!({"a": 1})).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), Some(json!({"a": 1})));

        store.kv_set("k", &json!([1, 2, 3])).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), Some(json!([1, 2, 3])));
    }
}
