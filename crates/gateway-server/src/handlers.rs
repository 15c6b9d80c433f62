//! HTTP request handlers for the gateway API.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::ChatRequest;
use gateway_relay::{shared, RelayRequest};
use gateway_routing::ChannelStatSnapshot;
use gateway_telemetry::LatencyStats;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    admission::Decision,
    body::{channel_writer, BODY_CHANNEL_CAPACITY},
    error::ApiError,
    extractors::{Caller, JsonBody, RequestId},
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

/// `{success, message, data}` envelope used by the management endpoints
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    /// Always true on 2xx
    pub success: bool,
    /// Human-readable note
    pub message: String,
    /// Payload
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: Some(data),
        }
    }
}

/// Model entry in `/v1/models`
#[derive(Debug, Serialize)]
pub struct ModelObject {
    /// Model name
    pub id: String,
    /// Always "model"
    pub object: &'static str,
    /// Always "relay-gateway"
    pub owned_by: &'static str,
}

/// `/v1/models` response
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    /// Always "list"
    pub object: &'static str,
    /// Models served by at least one enabled channel
    pub data: Vec<ModelObject>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.registry().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no channels available")
    } else {
        (StatusCode::OK, "ready")
    }
}

/// Liveness check endpoint
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::internal(format!("Failed to encode metrics: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

/// List models endpoint (OpenAI compatible)
#[instrument(skip(state))]
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let data = state
        .registry()
        .models()
        .into_iter()
        .map(|id| ModelObject {
            id,
            object: "model",
            owned_by: "relay-gateway",
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}

/// Chat completion endpoint (OpenAI compatible).
///
/// The relay runs in its own task so a client disconnect only drops the
/// response body, which cancels the relay and lets it settle.
#[instrument(skip_all, fields(request_id = %request_id, model = %body.model, stream = body.stream))]
pub async fn chat_completion(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Caller(caller): Caller,
    JsonBody(body): JsonBody<ChatRequest>,
) -> Result<Response, ApiError> {
    if let Decision::Deny { status, body: denial } = state.admission.admit(&caller, &body).await {
        info!(user_id = caller.user_id, status = status.as_u16(), "Request denied by admission");
        return Ok((status, Json(denial)).into_response());
    }

    debug!(user_id = caller.user_id, token_id = caller.token_id, "Relaying chat completion");

    let (writer, pending) = channel_writer(BODY_CHANNEL_CAPACITY);
    let cancel = state.relays.child_token();
    let guard = cancel.clone().drop_guard();

    let engine = state.engine.clone();
    let request = RelayRequest::new(request_id, caller, body);
    let task = state
        .relays
        .spawn(async move { engine.relay(request, shared(writer), cancel).await });

    pending.into_response(task, guard).await
}

/// Per-channel success counters
pub async fn channel_stats(State(state): State<AppState>) -> Json<Envelope<Vec<ChannelStatSnapshot>>> {
    Json(Envelope::ok(state.registry().stats().snapshot()))
}

/// First-byte latency statistics
pub async fn latency_stats(State(state): State<AppState>) -> Json<Envelope<LatencyStats>> {
    Json(Envelope::ok(state.latency.stats()))
}

/// Reset latency statistics
pub async fn reset_latency_stats(State(state): State<AppState>) -> Json<Envelope<()>> {
    state.latency.reset();
    info!("Latency statistics reset");
    Json(Envelope {
        success: true,
        message: "latency statistics reset".to_string(),
        data: None,
    })
}
