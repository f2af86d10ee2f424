//! Auth and scope gate.
//!
//! Bearer token → identity with scope set. The path decides which scope is
//! required; `/models` only requires a valid key.

use axum::http::{header, HeaderMap};

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::store::{Identity, Scope, Store};

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Resolve the request's credential to an identity.
pub async fn authenticate(
    store: &Store,
    cfg: &AuthConfig,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::Unauthenticated);
    };

    if cfg.dev_bypass {
        // Development only; the production self-check refuses this flag.
        return Ok(Identity {
            id: 0,
            name: "dev-bypass".to_string(),
            scopes: vec![Scope::Chat, Scope::Completions, Scope::Embeddings],
            rate_rps: None,
            rate_burst: None,
        });
    }

    match store.find_identity_by_token(token).await {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err(ApiError::Unauthenticated),
        Err(e) => Err(ApiError::Internal(format!("credential lookup failed: {e}"))),
    }
}

pub fn require_scope(identity: &Identity, required: Scope) -> Result<(), ApiError> {
    if identity.has_scope(required) {
        Ok(())
    } else {
        Err(ApiError::ForbiddenScope { required })
    }
}

/// Guard for the /admin surface. An empty configured token leaves admin
/// open, which only makes sense on a development host.
pub fn require_admin(cfg: &AuthConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    if cfg.admin_token.is_empty() {
        return Ok(());
    }
    match bearer_token(headers) {
        Some(token) if token == cfg.admin_token => Ok(()),
        _ => Err(ApiError::Unauthenticated),
    }
}
