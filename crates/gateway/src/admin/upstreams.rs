//! Registry and health introspection.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::auth::require_admin;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /admin/upstreams: the whole routing plane at a glance.
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;

    let registry: Value = serde_json::to_value(state.registry.as_map())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let (health, breakers) = state.health.snapshot().await;

    Ok(Json(json!({
        "registry": registry,
        "health": health,
        "breakers": breakers,
        "now": chrono::Utc::now().to_rfc3339(),
        "health_ttl_sec": state.config.health.ttl_secs,
    })))
}

/// POST /admin/upstreams/refresh-health: one-shot probe of every url.
pub async fn refresh_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;

    let urls = state.health.tracked().len();
    state.probe_runner.probe_all_once().await;

    Ok(Json(json!({ "probed": urls })))
}
