//! Client-visible error surface.
//!
//! Every failed request resolves to one `ApiError`, which renders as
//! `{ "error": { "code", "message", "detail"? } }` with a stable code.
//! Internal detail is logged server-side and never leaks to clients.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use runtime::engines::ModelTask;
use serde_json::json;
use thiserror::Error;

use crate::store::{ModelState, Scope, StoreError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or invalid API key")]
    Unauthenticated,

    #[error("API key lacks the '{required}' scope")]
    ForbiddenScope { required: Scope },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Too many concurrent streaming requests")]
    ConcurrencyLimited,

    #[error("No upstream registered for model '{served_name}'")]
    NoUpstream { served_name: String },

    #[error("Model '{served_name}' serves task '{actual}', not '{requested}'")]
    TaskMismatch {
        served_name: String,
        requested: ModelTask,
        actual: ModelTask,
    },

    #[error("Upstream did not respond within the request deadline")]
    UpstreamTimeout,

    #[error("Upstream error: {message}")]
    UpstreamError {
        status: Option<u16>,
        message: String,
    },

    #[error("Gateway is draining; retry against another instance")]
    Draining,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} a model in state '{state}'")]
    InvalidState {
        action: &'static str,
        state: ModelState,
    },

    #[error(
        "Engine image '{image}' is not cached locally and offline mode forbids pulling it; \
         load the image onto this host (docker load) and retry"
    )]
    ImageUnavailable { image: String },

    #[error("Weight split set is incomplete")]
    IncompleteSplitSet { missing: Vec<String> },

    #[error("Model requires downloading '{repo}' but offline mode is enabled")]
    OfflineRemoteRefused { repo: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "UNAUTHENTICATED",
            ApiError::ForbiddenScope { .. } => "FORBIDDEN_SCOPE",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::ConcurrencyLimited => "CONCURRENCY_LIMITED",
            ApiError::NoUpstream { .. } => "NO_UPSTREAM",
            ApiError::TaskMismatch { .. } => "TASK_MISMATCH",
            ApiError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ApiError::UpstreamError { .. } => "UPSTREAM_ERROR",
            ApiError::Draining => "DRAINING",
            ApiError::InvalidRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InvalidState { .. } => "INVALID_STATE",
            ApiError::ImageUnavailable { .. } => "IMAGE_UNAVAILABLE",
            ApiError::IncompleteSplitSet { .. } => "INCOMPLETE_SPLIT_SET",
            ApiError::OfflineRemoteRefused { .. } => "OFFLINE_REMOTE_REFUSED",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenScope { .. } => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } | ApiError::ConcurrencyLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::NoUpstream { .. } | ApiError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TaskMismatch { .. }
            | ApiError::InvalidRequest(_)
            | ApiError::ImageUnavailable { .. }
            | ApiError::IncompleteSplitSet { .. }
            | ApiError::OfflineRemoteRefused { .. } => StatusCode::BAD_REQUEST,
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidState { .. } => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::RateLimited { retry_after_secs } => {
                Some(json!({ "retry_after_secs": retry_after_secs }))
            }
            ApiError::IncompleteSplitSet { missing } => Some(json!({ "missing": missing })),
            ApiError::UpstreamError { status, .. } => {
                status.map(|s| json!({ "upstream_status": s }))
            }
            ApiError::TaskMismatch {
                requested, actual, ..
            } => Some(json!({
                "requested": requested.to_string(),
                "actual": actual.to_string(),
            })),
            _ => None,
        }
    }

    /// The JSON body for this error. Internal errors are sanitized.
    pub fn body(&self) -> serde_json::Value {
        let message = match self {
            ApiError::Internal(detail) => {
                tracing::error!(detail, "Internal error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let mut error = json!({
            "code": self.code(),
            "message": message,
        });
        if let Some(detail) = self.detail() {
            error["detail"] = detail;
        }
        json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            StoreError::Conflict(msg) => ApiError::InvalidRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
