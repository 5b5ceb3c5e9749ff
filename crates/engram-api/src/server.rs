use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use engram_runtime::DaemonHandle;

use crate::error::ApiError;
use crate::ratelimit::RateLimiter;
use crate::routes;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub handle: Arc<DaemonHandle>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(handle: Arc<DaemonHandle>) -> Router {
    let state = AppState {
        handle: handle.clone(),
        limiter: Arc::new(RateLimiter::new()),
    };

    let cors = {
        let origins = handle.config_snapshot().api_cors_origins;
        if origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    let api = Router::new()
        .route("/stats", get(routes::stats))
        .route("/status", get(routes::status))
        .route("/nodes", get(routes::list_nodes))
        .route("/nodes/{id}", get(routes::get_node))
        .route("/nodes/{id}/raw", get(routes::get_node_raw))
        .route("/search", get(routes::search))
        .route("/decisions", get(routes::list_decisions))
        .route("/decisions/{id}", put(routes::update_decision))
        .route("/insights", get(routes::list_insights))
        .route("/insights/{id}", put(routes::update_insight))
        .route("/insights/{id}/effectiveness", get(routes::insight_effectiveness))
        .route("/patterns/failures", get(routes::failure_patterns))
        .route("/patterns/lessons", get(routes::lesson_patterns))
        .route("/patterns/models", get(routes::model_patterns))
        .route("/clusters", get(routes::list_clusters))
        .route("/config", get(routes::get_config).put(routes::put_config))
        .route("/providers", get(routes::providers))
        .route("/query", post(routes::query))
        .route("/health", get(routes::health));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(cors)
        .with_state(state)
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    state
        .limiter
        .check(addr.ip())
        .map_err(|retry_after_seconds| ApiError::RateLimited {
            retry_after_seconds,
        })?;
    Ok(next.run(request).await)
}

/// Bind and serve until cancellation, then stop accepting and drain within
/// the configured grace.
pub async fn serve(handle: Arc<DaemonHandle>) -> std::io::Result<()> {
    let config = handle.config_snapshot();
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let request_timeout = Duration::from_secs(config.http_timeout_seconds);
    let cancel = handle.cancel.clone();

    let app = router(handle)
        .layer(tower_http::timeout::TimeoutLayer::new(request_timeout));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "http surface listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
}
