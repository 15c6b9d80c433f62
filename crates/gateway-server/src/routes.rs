//! Route definitions for the gateway API.

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{extractors::REQUEST_ID_HEADER, handlers, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/healthz", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // OpenAI-compatible endpoints
        .nest("/v1", openai_routes())
        // Management endpoints
        .nest("/api", management_routes())
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}

/// OpenAI-compatible API routes
fn openai_routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completion))
        .route("/models", get(handlers::list_models))
}

/// Channel and latency statistics
fn management_routes() -> Router<AppState> {
    Router::new()
        .route("/channel/stats", get(handlers::channel_stats))
        .route(
            "/latency",
            get(handlers::latency_stats).delete(handlers::reset_latency_stats),
        )
}
