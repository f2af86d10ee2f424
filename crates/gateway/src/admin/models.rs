//! Model CRUD and lifecycle actions.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::require_admin;
use crate::error::ApiError;
use crate::lifecycle::validate_source;
use crate::state::AppState;
use crate::store::{ModelPatch, ModelRecord, NewModel};

fn model_json(record: &ModelRecord) -> Value {
    json!({
        "id": record.id,
        "display_name": record.display_name,
        "served_name": record.served_name,
        "engine": record.engine.to_string(),
        "task": record.task.to_string(),
        "repo_id": record.repo_id,
        "local_path": record.local_path,
        "params": record.params,
        "state": record.state.to_string(),
        "host_port": record.host_port,
        "container_name": record.container_name,
        "failure_reason": record.failure_reason,
        "created_at": record.created_at.to_rfc3339(),
        "updated_at": record.updated_at.to_rfc3339(),
    })
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let models = state.store.list_models(query.include_archived).await?;
    Ok(Json(json!({
        "models": models.iter().map(model_json).collect::<Vec<_>>(),
        "total": models.len(),
    })))
}

/// Served names are client-visible tokens and must stay URL-safe.
fn validate_served_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(format!(
            "served name '{name}' must be non-empty and contain only [A-Za-z0-9._-]"
        )))
    }
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewModel>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    validate_served_name(&new.served_name)?;
    validate_source(&new)?;

    let record = state.store.insert_model(&new).await?;
    tracing::info!(model_id = record.id, served_name = %record.served_name, "Model declared");
    Ok(Json(model_json(&record)))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.store.get_model(id).await?;
    Ok(Json(model_json(&record)))
}

pub async fn patch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(patch): Json<ModelPatch>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;

    let record = state.store.get_model(id).await?;
    if record.state.is_live() {
        return Err(ApiError::InvalidState {
            action: "edit",
            state: record.state,
        });
    }

    let updated = state.store.patch_model(id, &patch).await?;
    Ok(Json(model_json(&updated)))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    state.lifecycle.delete(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.start(id).await?;
    Ok(Json(model_json(&record)))
}

pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.stop(id).await?;
    Ok(Json(model_json(&record)))
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.cancel(id).await?;
    Ok(Json(model_json(&record)))
}

pub async fn archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.archive(id).await?;
    Ok(Json(model_json(&record)))
}

pub async fn unarchive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.unarchive(id).await?;
    Ok(Json(model_json(&record)))
}

/// Persist new engine parameters and bounce the model.
pub async fn reconfigure(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(params): Json<runtime::engines::EngineParams>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let record = state.lifecycle.reconfigure(id, params).await?;
    Ok(Json(model_json(&record)))
}

pub async fn dry_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    Ok(Json(state.lifecycle.dry_run(id).await?))
}

pub async fn test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    Ok(Json(state.lifecycle.test_model(id).await?))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    100
}

pub async fn logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state.config.auth, &headers)?;
    let tail = state.lifecycle.logs(id, query.tail.min(10_000)).await?;
    Ok(Json(json!({ "model_id": id, "logs": tail })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support;
    use axum::http::header;
    use runtime::engines::{EngineParams, ModelTask, TransformerParams};

    fn admin_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer admin-token".parse().unwrap());
        headers
    }

    async fn admin_state() -> AppState {
        let mut config = crate::config::GatewayConfig::default();
        config.auth.admin_token = "admin-token".to_string();
        let (state, _) = test_support::state_with(config).await;
        state
    }

    fn new_model(served: &str) -> NewModel {
        NewModel {
            display_name: served.to_string(),
            served_name: served.to_string(),
            task: ModelTask::Generate,
            repo_id: Some("org/model".to_string()),
            local_path: None,
            params: EngineParams::TransformerEngine(TransformerParams::default()),
        }
    }

    #[tokio::test]
    async fn test_admin_token_required() {
        let state = admin_state().await;
        let err = list(
            State(state),
            HeaderMap::new(),
            Query(ListQuery {
                include_archived: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_create_validates_served_name() {
        let state = admin_state().await;
        let mut bad = new_model("has space");
        bad.served_name = "has space".to_string();

        let err = create(State(state), admin_headers(), Json(bad))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let state = admin_state().await;
        create(State(state.clone()), admin_headers(), Json(new_model("llama")))
            .await
            .unwrap();

        let Json(body) = list(
            State(state),
            admin_headers(),
            Query(ListQuery {
                include_archived: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["total"], 1);
        assert_eq!(body["models"][0]["served_name"], "llama");
        assert_eq!(body["models"][0]["state"], "stopped");
    }

    #[tokio::test]
    async fn test_patch_rejected_while_live() {
        let state = admin_state().await;
        let Json(created) = create(
            State(state.clone()),
            admin_headers(),
            Json(new_model("llama")),
        )
        .await
        .unwrap();
        let id = created["id"].as_i64().unwrap();

        start(State(state.clone()), admin_headers(), Path(id))
            .await
            .unwrap();

        let err = patch(
            State(state),
            admin_headers(),
            Path(id),
            Json(ModelPatch {
                display_name: Some("renamed".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_start_action_flow() {
        let state = admin_state().await;
        let Json(created) = create(
            State(state.clone()),
            admin_headers(),
            Json(new_model("llama")),
        )
        .await
        .unwrap();
        let id = created["id"].as_i64().unwrap();

        let Json(started) = start(State(state.clone()), admin_headers(), Path(id))
            .await
            .unwrap();
        assert_eq!(started["state"], "starting");
        assert!(started["host_port"].as_u64().is_some());

        let Json(stopped) = stop(State(state), admin_headers(), Path(id))
            .await
            .unwrap();
        assert_eq!(stopped["state"], "stopped");
        assert!(stopped["host_port"].is_null());
    }
}
