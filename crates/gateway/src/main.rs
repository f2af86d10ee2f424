mod admin;
mod api;
mod auth;
mod balancer;
mod breaker;
mod cache;
mod config;
mod error;
mod health;
mod lifecycle;
mod limits;
mod metrics;
mod proxy;
mod registry;
mod shutdown;
mod state;
mod store;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{GatewayConfig, LogFormat, LogOutput};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so configuration loading can log.
    // Thread-local, replaced by the global subscriber in phase 2.
    let _basic_tracing = init_tracing_basic();

    info!("Starting Cortex gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load().context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    // Phase 2: re-initialize tracing with the configured format and level.
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!("Configuration loaded successfully");
    info!("Server will bind to: {}", config.server.bind_address);
    info!(
        "Models root: {} (offline={})",
        config.models.root, config.models.offline
    );

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("Invalid bind address")?;

    let state = AppState::new(config).await.context("Failed to build state")?;
    state
        .initialize()
        .await
        .context("Failed to initialize application state")?;

    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Cortex gateway is ready");
    info!("  - OpenAI surface: http://{addr}/v1");
    info!("  - Admin surface:  http://{addr}/admin");
    info!("  - Health check:   http://{addr}/health");
    info!("Listening on: http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain, stop owned containers, close cache and store.
    shutdown::run(&state).await;

    info!("Server shut down gracefully");
    Ok(())
}

/// Build the application router.
fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.enable_cors {
        let origins = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|s| s.parse::<axum::http::HeaderValue>().ok())
            .collect::<Vec<_>>();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        CorsLayer::new()
    };

    // Covers handler latency up to the unary proxy deadline; streamed
    // responses return their headers long before this fires.
    let request_timeout =
        Duration::from_secs(state.config.server.request_timeout_unary_secs + 30);

    let openai_routes = Router::new()
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/completions", post(api::completions))
        .route("/v1/embeddings", post(api::embeddings))
        .route("/v1/models", get(api::list_models));

    let admin_routes = Router::new()
        .route("/admin/models", get(admin::models::list).post(admin::models::create))
        .route(
            "/admin/models/{id}",
            get(admin::models::get)
                .patch(admin::models::patch)
                .delete(admin::models::delete),
        )
        .route("/admin/models/{id}/start", post(admin::models::start))
        .route("/admin/models/{id}/stop", post(admin::models::stop))
        .route("/admin/models/{id}/cancel", post(admin::models::cancel))
        .route("/admin/models/{id}/archive", post(admin::models::archive))
        .route("/admin/models/{id}/unarchive", post(admin::models::unarchive))
        .route("/admin/models/{id}/reconfigure", post(admin::models::reconfigure))
        .route("/admin/models/{id}/dry-run", post(admin::models::dry_run))
        .route("/admin/models/{id}/test", post(admin::models::test))
        .route("/admin/models/{id}/logs", get(admin::models::logs))
        .route("/admin/upstreams", get(admin::upstreams::get))
        .route(
            "/admin/upstreams/refresh-health",
            post(admin::upstreams::refresh_health),
        )
        .route("/admin/system/docker-images", get(admin::system::docker_images))
        .route("/admin/usage", get(admin::system::usage));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .merge(openai_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            shutdown::drain_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                // Prompt bodies are small; 2 MiB caps abuse.
                .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    request_timeout,
                )),
        )
        .with_state(state)
}

/// Root handler: API info.
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "Cortex Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "openai": "/v1",
            "admin": "/admin",
            "health": "/health",
            "ready": "/ready",
            "metrics": "/metrics"
        }
    }))
}

/// Liveness: answers even while draining so orchestrators see the state.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": if state.is_draining() { "draining" } else { "ok" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Readiness: store and container daemon reachable, not draining.
async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": "draining" })),
        );
    }

    let store_ok = state.store.list_models(false).await.is_ok();
    let docker_ok = state.driver.ping().await.is_ok();
    let ready = store_ok && docker_ok;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": ready,
            "store": store_ok,
            "docker": docker_ok,
        })),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = state.metrics.as_json();
    body["registry"] = json!({
        "served_names": state.registry.served_names().len(),
        "urls": state.registry.urls().len(),
    });
    Json(body)
}

/// Phase 1: basic tracing init so we can log during config loading.
fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gateway=debug"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: re-initialize tracing with configuration values.
fn init_tracing_from_config(config: &GatewayConfig) {
    use std::sync::Arc;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match (&config.logging.format, &config.logging.output) {
        (LogFormat::Json, LogOutput::Stdout) => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Json, LogOutput::File { path }) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("Failed to open log file '{}': {}", path, e));
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::Stdout) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::File { path }) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("Failed to open log file '{}': {}", path, e));
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
