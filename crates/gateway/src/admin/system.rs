//! Offline image reporting and usage inspection.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::require_admin;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /admin/system/docker-images: cache status of the engine images.
pub async fn docker_images(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;

    let required = vec![
        state.config.models.transformer_image.clone(),
        state.config.models.quantized_image.clone(),
    ];
    let local = state
        .driver
        .list_images()
        .await
        .map_err(|e| ApiError::Internal(format!("image listing failed: {e}")))?;

    let mut images = Vec::with_capacity(required.len());
    let mut ready = true;
    for name in &required {
        let cached = local.iter().find(|img| &img.reference == name);
        if cached.is_none() {
            ready = false;
        }
        images.push(json!({
            "name": name,
            "cached": cached.is_some(),
            "size_mb": cached.map(|c| c.size_bytes / (1024 * 1024)),
            "created": cached.map(|c| c.created),
        }));
    }

    Ok(Json(json!({
        "images": images,
        "ready": ready,
        "required": required,
        "offline_mode": state.config.models.offline,
    })))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_usage_limit")]
    pub limit: u32,
}

fn default_usage_limit() -> u32 {
    100
}

/// GET /admin/usage: most recent usage rows.
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let rows = state.store.recent_usage(query.limit.min(1000)).await?;
    Ok(Json(json!({ "total": rows.len(), "usage": rows })))
}
