//! Request proxy: the data plane.
//!
//! Takes an authenticated request, a balancer decision, and relays the
//! body to the chosen upstream. Buffered responses may retry once against
//! a fresh balancer decision; streamed responses never retry. Every
//! terminated request appends a usage row asynchronously.

pub mod convert;
pub mod tokens;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use runtime::engines::ModelTask;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::balancer::RouteError;
use crate::error::ApiError;
use crate::limits::StreamPermit;
use crate::state::AppState;
use crate::store::{Identity, Scope, UsageRow};

/// Backoff before the single unary retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound on text accumulated from a stream for token estimation.
const STREAM_ACCUMULATION_CAP: usize = 1 << 20;

/// The three proxied OpenAI endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Completions => "/v1/completions",
            Endpoint::Embeddings => "/v1/embeddings",
        }
    }

    pub fn task(self) -> ModelTask {
        match self {
            Endpoint::ChatCompletions | Endpoint::Completions => ModelTask::Generate,
            Endpoint::Embeddings => ModelTask::Embed,
        }
    }

    pub fn required_scope(self) -> Scope {
        match self {
            Endpoint::ChatCompletions => Scope::Chat,
            Endpoint::Completions => Scope::Completions,
            Endpoint::Embeddings => Scope::Embeddings,
        }
    }

    fn streaming_allowed(self) -> bool {
        !matches!(self, Endpoint::Embeddings)
    }
}

/// What one upstream send attempt produced.
enum SendResult {
    Response(reqwest::Response),
    /// Transient transport failure; a retry against a fresh balancer
    /// decision may succeed.
    Retryable(String),
    Timeout,
}

async fn send_once(
    client: &reqwest::Client,
    url: &str,
    path: &str,
    body: &Value,
    internal_key: &str,
    deadline: Instant,
) -> SendResult {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return SendResult::Timeout;
    }

    let target = format!("{}{}", url.trim_end_matches('/'), path);
    let result = client
        .post(&target)
        .bearer_auth(internal_key)
        .json(body)
        .timeout(remaining)
        .send()
        .await;

    match result {
        Ok(response) => SendResult::Response(response),
        Err(e) if e.is_timeout() => SendResult::Timeout,
        Err(e) => SendResult::Retryable(e.to_string()),
    }
}

fn record_usage(state: &AppState, row: UsageRow) {
    let store = state.store.clone();
    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = store.append_usage(&row).await {
            metrics.record_usage_write_failure();
            tracing::warn!(error = %e, request_id = %row.request_id, "Failed to persist usage row");
        }
    });
}

struct RequestScope {
    request_id: String,
    identity_id: i64,
    served_name: String,
    task: ModelTask,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

impl RequestScope {
    fn usage_row(&self, status: u16, prompt_tokens: i64, completion_tokens: i64) -> UsageRow {
        UsageRow {
            request_id: self.request_id.clone(),
            identity_id: self.identity_id,
            served_name: self.served_name.clone(),
            task: self.task.to_string(),
            prompt_tokens,
            completion_tokens,
            latency_ms: self.started.elapsed().as_millis() as i64,
            status,
            started_at: self.started_at,
        }
    }
}

/// Proxy one authenticated request. Auth and rate admission have already
/// happened; this owns balancer selection, the upstream exchange, usage
/// accounting, and breaker feedback.
pub async fn handle(
    state: &AppState,
    identity: &Identity,
    endpoint: Endpoint,
    mut body: Value,
) -> Result<Response, ApiError> {
    let served_name = body
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| ApiError::InvalidRequest("missing 'model' field".to_string()))?
        .to_string();

    let task = endpoint.task();
    let stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)
        && endpoint.streaming_allowed();
    if !endpoint.streaming_allowed() {
        if let Some(object) = body.as_object_mut() {
            object.remove("stream");
        }
    }

    let scope = RequestScope {
        request_id: Uuid::new_v4().to_string(),
        identity_id: identity.id,
        served_name: served_name.clone(),
        task,
        started_at: Utc::now(),
        started: Instant::now(),
    };

    let url = match state.balancer.choose(&served_name, task).await {
        Ok(url) => url,
        Err(RouteError::NoUpstream) => {
            // Recognised refusal: account it with the refusal status.
            record_usage(state, scope.usage_row(503, 0, 0));
            return Err(ApiError::NoUpstream { served_name });
        }
        Err(RouteError::TaskMismatch { requested, actual }) => {
            record_usage(state, scope.usage_row(400, 0, 0));
            return Err(ApiError::TaskMismatch {
                served_name,
                requested,
                actual,
            });
        }
    };

    if stream {
        let permit = state.streams.acquire().await?;
        proxy_streamed(state, endpoint, body, url, scope, permit).await
    } else {
        proxy_unary(state, endpoint, body, url, scope).await
    }
}

async fn proxy_unary(
    state: &AppState,
    endpoint: Endpoint,
    body: Value,
    first_url: String,
    scope: RequestScope,
) -> Result<Response, ApiError> {
    let deadline =
        scope.started + Duration::from_secs(state.config.server.request_timeout_unary_secs);
    let internal_key = &state.config.auth.upstream_internal_key;

    let mut url = first_url;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let sent = send_once(&state.http, &url, endpoint.path(), &body, internal_key, deadline).await;

        let retry_reason = match sent {
            SendResult::Timeout => {
                state.health.record_request_outcome(&url, false).await;
                record_usage(state, scope.usage_row(504, 0, 0));
                return Err(ApiError::UpstreamTimeout);
            }
            SendResult::Retryable(message) => {
                state.health.record_request_outcome(&url, false).await;
                message
            }
            SendResult::Response(response) => {
                let status = response.status();
                if status.is_server_error() {
                    state.health.record_request_outcome(&url, false).await;
                    format!("upstream returned {status}")
                } else {
                    state.health.record_request_outcome(&url, true).await;
                    return finish_unary(state, endpoint, &body, &url, response, scope, deadline)
                        .await;
                }
            }
        };

        if attempt >= 2 {
            record_usage(state, scope.usage_row(502, 0, 0));
            return Err(ApiError::UpstreamError {
                status: None,
                message: retry_reason,
            });
        }

        // One retry against a fresh balancer decision, which may pick a
        // different url if this one just went unhealthy.
        state.metrics.record_upstream_retry();
        tokio::time::sleep(RETRY_BACKOFF).await;
        url = match state.balancer.choose(&scope.served_name, scope.task).await {
            Ok(url) => url,
            Err(_) => {
                record_usage(state, scope.usage_row(503, 0, 0));
                return Err(ApiError::NoUpstream {
                    served_name: scope.served_name.clone(),
                });
            }
        };
    }
}

async fn finish_unary(
    state: &AppState,
    endpoint: Endpoint,
    request_body: &Value,
    url: &str,
    response: reqwest::Response,
    scope: RequestScope,
    deadline: Instant,
) -> Result<Response, ApiError> {
    let status = response.status();
    let upstream_json: Value = response.json().await.map_err(|e| {
        ApiError::UpstreamError {
            status: Some(status.as_u16()),
            message: format!("unreadable upstream body: {e}"),
        }
    })?;

    // A checkpoint without a chat template rejects chat requests; fall back
    // to a plain completion transparently.
    if endpoint == Endpoint::ChatCompletions
        && convert::is_chat_template_missing(status.as_u16(), &upstream_json)
    {
        tracing::info!(
            served_name = %scope.served_name,
            "Upstream lacks a chat template, falling back to completion"
        );
        return chat_fallback_unary(state, request_body, url, scope, deadline).await;
    }

    let (prompt_tokens, completion_tokens) = tokens::usage_from_response(&upstream_json)
        .unwrap_or_else(|| {
            (
                tokens::estimate_tokens(&tokens::request_text(request_body)),
                tokens::estimate_tokens(&tokens::response_text(&upstream_json)),
            )
        });

    record_usage(
        state,
        scope.usage_row(status.as_u16(), prompt_tokens, completion_tokens),
    );

    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(upstream_json)).into_response())
}

async fn chat_fallback_unary(
    state: &AppState,
    chat_body: &Value,
    url: &str,
    scope: RequestScope,
    deadline: Instant,
) -> Result<Response, ApiError> {
    let completion_body = convert::chat_to_completion(chat_body);
    let internal_key = &state.config.auth.upstream_internal_key;

    let sent = send_once(
        &state.http,
        url,
        Endpoint::Completions.path(),
        &completion_body,
        internal_key,
        deadline,
    )
    .await;

    let response = match sent {
        SendResult::Response(r) if r.status().is_success() => r,
        SendResult::Response(r) => {
            let status = r.status().as_u16();
            record_usage(state, scope.usage_row(502, 0, 0));
            return Err(ApiError::UpstreamError {
                status: Some(status),
                message: "completion fallback rejected by upstream".to_string(),
            });
        }
        SendResult::Timeout => {
            record_usage(state, scope.usage_row(504, 0, 0));
            return Err(ApiError::UpstreamTimeout);
        }
        SendResult::Retryable(message) => {
            record_usage(state, scope.usage_row(502, 0, 0));
            return Err(ApiError::UpstreamError {
                status: None,
                message,
            });
        }
    };

    let completion_json: Value = response.json().await.map_err(|e| ApiError::UpstreamError {
        status: None,
        message: format!("unreadable fallback body: {e}"),
    })?;
    let chat_json = convert::completion_to_chat(&completion_json);

    let (prompt_tokens, completion_tokens) =
        tokens::usage_from_response(&chat_json).unwrap_or_else(|| {
            (
                tokens::estimate_tokens(&tokens::request_text(chat_body)),
                tokens::estimate_tokens(&tokens::response_text(&chat_json)),
            )
        });
    record_usage(state, scope.usage_row(200, prompt_tokens, completion_tokens));

    Ok((StatusCode::OK, Json(chat_json)).into_response())
}

fn sse_error_event(code: &str, message: &str) -> Bytes {
    let payload = serde_json::json!({ "error": { "code": code, "message": message } });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

/// Extract generated text from one SSE data payload, both chunk shapes.
fn delta_text(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(content) = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(content.to_string());
    }
    choice.get("text").and_then(|t| t.as_str()).map(String::from)
}

async fn proxy_streamed(
    state: &AppState,
    endpoint: Endpoint,
    body: Value,
    url: String,
    scope: RequestScope,
    permit: StreamPermit,
) -> Result<Response, ApiError> {
    let deadline =
        scope.started + Duration::from_secs(state.config.server.request_timeout_stream_secs);
    let internal_key = &state.config.auth.upstream_internal_key;

    // No retry on streams: one attempt, refusal otherwise.
    let sent = send_once(&state.http, &url, endpoint.path(), &body, internal_key, deadline).await;
    let response = match sent {
        SendResult::Response(r) => r,
        SendResult::Timeout => {
            state.health.record_request_outcome(&url, false).await;
            record_usage(state, scope.usage_row(504, 0, 0));
            return Err(ApiError::UpstreamTimeout);
        }
        SendResult::Retryable(message) => {
            state.health.record_request_outcome(&url, false).await;
            record_usage(state, scope.usage_row(502, 0, 0));
            return Err(ApiError::UpstreamError {
                status: None,
                message,
            });
        }
    };

    let status = response.status();
    if !status.is_success() {
        let failed = status.is_server_error();
        state.health.record_request_outcome(&url, !failed).await;

        let upstream_json: Value = response.json().await.unwrap_or(Value::Null);
        if endpoint == Endpoint::ChatCompletions
            && convert::is_chat_template_missing(status.as_u16(), &upstream_json)
        {
            // Fall back to a buffered completion and frame it as a short
            // SSE stream so the client still gets what it asked for.
            let buffered =
                chat_fallback_unary(state, &body, &url, scope, deadline).await?;
            return Ok(rewrap_as_sse(buffered).await);
        }

        record_usage(state, scope.usage_row(status.as_u16(), 0, 0));
        if failed {
            return Err(ApiError::UpstreamError {
                status: Some(status.as_u16()),
                message: "upstream refused the stream".to_string(),
            });
        }
        let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Ok((status, Json(upstream_json)).into_response());
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();

    let prompt_estimate = tokens::estimate_tokens(&tokens::request_text(&body));
    let store = state.store.clone();
    let metrics = state.metrics.clone();
    let health = state.health.clone();
    let upstream_url = url.clone();

    let relay = async_stream::stream! {
        // Held for the life of the stream; drop releases the slot on every
        // exit path including client disconnect.
        let _permit = permit;
        let mut upstream = response.bytes_stream();
        let mut generated = String::new();
        let mut reported_usage: Option<(i64, i64)> = None;
        let mut final_status: u16 = 200;
        let mut clean_finish = true;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                yield Ok::<Bytes, std::convert::Infallible>(sse_error_event(
                    "UPSTREAM_TIMEOUT",
                    "stream deadline exceeded",
                ));
                final_status = 504;
                clean_finish = false;
                break;
            }

            match tokio::time::timeout(remaining, upstream.next()).await {
                Err(_) => {
                    yield Ok(sse_error_event("UPSTREAM_TIMEOUT", "stream deadline exceeded"));
                    final_status = 504;
                    clean_finish = false;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    yield Ok(sse_error_event("UPSTREAM_ERROR", &e.to_string()));
                    final_status = 502;
                    clean_finish = false;
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    if generated.len() < STREAM_ACCUMULATION_CAP {
                        for line in String::from_utf8_lossy(&chunk).lines() {
                            let Some(data) = line.strip_prefix("data: ") else { continue };
                            if data == "[DONE]" {
                                continue;
                            }
                            if let Some(text) = delta_text(data) {
                                generated.push_str(&text);
                            }
                            if let Ok(value) = serde_json::from_str::<Value>(data) {
                                if let Some(usage) = tokens::usage_from_response(&value) {
                                    reported_usage = Some(usage);
                                }
                            }
                        }
                    }
                    // Back-pressure: the chunk reaches the client before
                    // the next upstream read.
                    yield Ok(chunk);
                }
            }
        }

        health.record_request_outcome(&upstream_url, clean_finish).await;
        let (prompt_tokens, completion_tokens) = reported_usage
            .unwrap_or_else(|| (prompt_estimate, tokens::estimate_tokens(&generated)));
        let row = scope.usage_row(final_status, prompt_tokens, completion_tokens);
        if let Err(e) = store.append_usage(&row).await {
            metrics.record_usage_write_failure();
            tracing::warn!(error = %e, "Failed to persist usage row for stream");
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(relay))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Re-frame a buffered chat completion as a two-event SSE stream.
async fn rewrap_as_sse(buffered: Response) -> Response {
    let body = match axum::body::to_bytes(buffered.into_body(), 4 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::Internal("fallback body too large".to_string()).into_response(),
    };
    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let chunk = serde_json::json!({
        "id": value.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion.chunk",
        "created": value.get("created").cloned().unwrap_or(Value::Null),
        "model": value.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "delta": {
                "role": "assistant",
                "content": value["choices"][0]["message"]["content"].as_str().unwrap_or(""),
            },
            "finish_reason": value["choices"][0]["finish_reason"].clone(),
        }],
    });

    let framed = format!("data: {chunk}\n\ndata: [DONE]\n\n");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(framed))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
