//! Shutdown coordinator.
//!
//! On termination: flip into draining (new requests get 503), wait out
//! in-flight work up to the drain timeout, stop every owned container,
//! then close the cache and the store. The boot orphan sweep covers the
//! crash path.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::error::ApiError;
use crate::state::AppState;

/// Counts in-flight requests and refuses new ones while draining. The
/// health endpoint stays reachable so orchestrators can see the gateway
/// going away.
pub async fn drain_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.is_draining() && request.uri().path() != "/health" {
        return ApiError::Draining.into_response();
    }

    state.in_flight.fetch_add(1, Ordering::AcqRel);
    let response = next.run(request).await;
    state.in_flight.fetch_sub(1, Ordering::AcqRel);
    response
}

/// Run the coordinated shutdown. Called once, after the server loop exits.
pub async fn run(state: &AppState) {
    tracing::info!("Shutdown: draining in-flight requests...");
    state.begin_drain();

    let deadline = Instant::now()
        + Duration::from_secs(state.config.server.drain_timeout_secs);
    loop {
        let pending = state.in_flight.load(Ordering::Acquire);
        let streaming = state.metrics.streams_active();
        if pending <= 0 && streaming <= 0 {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(pending, streaming, "Drain timeout, abandoning in-flight work");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Shutdown: stopping owned model containers...");
    state.lifecycle.stop_all_live().await;

    state.cache.close();
    state.store.close().await;
    tracing::info!("Shutdown complete");
}
