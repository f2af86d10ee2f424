//! Client-facing OpenAI-compatible surface.
//!
//! Flow per request: auth -> scope -> rate -> proxy. Every error renders
//! as the structured JSON envelope.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};

use crate::auth;
use crate::error::ApiError;
use crate::proxy::{self, Endpoint};
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    openai_request(state, headers, body, Endpoint::ChatCompletions).await
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    openai_request(state, headers, body, Endpoint::Completions).await
}

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    openai_request(state, headers, body, Endpoint::Embeddings).await
}

async fn openai_request(
    state: AppState,
    headers: HeaderMap,
    body: Value,
    endpoint: Endpoint,
) -> Result<Response, ApiError> {
    state.metrics.record_request();

    let identity = match auth::authenticate(&state.store, &state.config.auth, &headers).await {
        Ok(identity) => identity,
        Err(e) => {
            state.metrics.record_auth_rejected();
            return Err(e);
        }
    };
    if let Err(e) = auth::require_scope(&identity, endpoint.required_scope()) {
        state.metrics.record_auth_rejected();
        return Err(e);
    }

    if let Err(e) = state.rate.check(&identity).await {
        if matches!(e, ApiError::RateLimited { .. }) {
            state.metrics.record_rate_limited();
        }
        return Err(e);
    }

    match proxy::handle(&state, &identity, endpoint, body).await {
        Ok(response) => Ok(response),
        Err(e) => {
            state.metrics.record_failure();
            Err(e)
        }
    }
}

/// GET /v1/models: every registered served name, regardless of health.
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    auth::authenticate(&state.store, &state.config.auth, &headers).await?;

    let data: Vec<Value> = state
        .registry
        .served_names()
        .into_iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "owned_by": "cortex",
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}
