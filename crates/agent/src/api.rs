//! HTTP API for health checks, upload status and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use funk_agent_lib::{
    collector::TrackerRegistry,
    health::{ComponentStatus, HealthRegistry},
    sync::UploadStats,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub upload_stats: Arc<RwLock<UploadStats>>,
    pub registry: Option<Arc<TrackerRegistry>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        upload_stats: Arc<RwLock<UploadStats>>,
    ) -> Self {
        Self {
            health_registry,
            upload_stats,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<TrackerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// Upload and tracking summary
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub trackers: usize,
    pub batches_sent: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub dropped_messages: u64,
    pub reconnect_attempts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still shipping
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once connected to the collector
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let trackers = match &state.registry {
        Some(registry) => registry.len().await,
        None => 0,
    };
    let upload = state.upload_stats.read().await.clone();

    Json(StatusResponse {
        trackers,
        batches_sent: upload.batches_sent,
        messages_sent: upload.messages_sent,
        send_failures: upload.send_failures,
        dropped_messages: upload.dropped_messages,
        reconnect_attempts: upload.reconnect_attempts,
        last_error: upload.last_error,
    })
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
