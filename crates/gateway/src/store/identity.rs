//! Identities and API keys.
//!
//! Keys are stored as SHA-256 digests; lookup goes by digest prefix, then a
//! full-digest compare. The plaintext never touches the database.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;

use super::{Store, StoreError};

/// Permission scopes an API key may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Chat,
    Completions,
    Embeddings,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Chat => write!(f, "chat"),
            Scope::Completions => write!(f, "completions"),
            Scope::Embeddings => write!(f, "embeddings"),
        }
    }
}

/// The resolution target of a credential: who is calling and what they may
/// do, plus optional per-identity rate overrides.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub scopes: Vec<Scope>,
    pub rate_rps: Option<u32>,
    pub rate_burst: Option<u32>,
}

impl Identity {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

pub(crate) fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Digest prefix length used for the indexed lookup.
const PREFIX_LEN: usize = 12;

impl Store {
    pub async fn create_identity(
        &self,
        name: &str,
        rate_rps: Option<u32>,
        rate_burst: Option<u32>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO identities (name, rate_rps, rate_burst, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(rate_rps.map(|v| v as i64))
        .bind(rate_burst.map(|v| v as i64))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store a key for an identity. Only the digest is persisted.
    pub async fn create_api_key(
        &self,
        identity_id: i64,
        token: &str,
        scopes: &[Scope],
    ) -> Result<(), StoreError> {
        let digest = token_digest(token);
        let scopes_json =
            serde_json::to_string(scopes).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            "INSERT INTO api_keys (identity_id, key_prefix, key_hash, scopes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(identity_id)
        .bind(&digest[..PREFIX_LEN])
        .bind(&digest)
        .bind(&scopes_json)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Resolve a presented bearer token to its identity, or `None` for an
    /// unknown or revoked key.
    pub async fn find_identity_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Identity>, StoreError> {
        let digest = token_digest(token);

        let rows = sqlx::query(
            "SELECT k.identity_id, k.key_hash, k.scopes, i.name, i.rate_rps, i.rate_burst \
             FROM api_keys k JOIN identities i ON i.id = k.identity_id \
             WHERE k.key_prefix = ?1",
        )
        .bind(&digest[..PREFIX_LEN])
        .fetch_all(self.pool())
        .await?;

        for row in rows {
            let stored_hash: String = row.try_get("key_hash")?;
            if stored_hash != digest {
                continue;
            }
            let scopes_json: String = row.try_get("scopes")?;
            let scopes: Vec<Scope> = serde_json::from_str(&scopes_json)
                .map_err(|e| StoreError::Corrupt(format!("bad scope set: {e}")))?;
            return Ok(Some(Identity {
                id: row.try_get("identity_id")?,
                name: row.try_get("name")?,
                scopes,
                rate_rps: row.try_get::<Option<i64>, _>("rate_rps")?.map(|v| v as u32),
                rate_burst: row.try_get::<Option<i64>, _>("rate_burst")?.map(|v| v as u32),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_resolves_to_identity_with_scopes() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("alice", None, None).await.unwrap();
        store
            .create_api_key(id, "sk-test-token", &[Scope::Chat, Scope::Completions])
            .await
            .unwrap();

        let identity = store
            .find_identity_by_token("sk-test-token")
            .await
            .unwrap()
            .expect("identity");
        assert_eq!(identity.id, id);
        assert_eq!(identity.name, "alice");
        assert!(identity.has_scope(Scope::Chat));
        assert!(!identity.has_scope(Scope::Embeddings));
    }

    #[tokio::test]
    async fn test_unknown_token_resolves_to_none() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store
            .find_identity_by_token("sk-nope")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rate_overrides_loaded() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .create_identity("bob", Some(50), Some(100))
            .await
            .unwrap();
        store
            .create_api_key(id, "sk-bob", &[Scope::Embeddings])
            .await
            .unwrap();

        let identity = store
            .find_identity_by_token("sk-bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.rate_rps, Some(50));
        assert_eq!(identity.rate_burst, Some(100));
    }
}
