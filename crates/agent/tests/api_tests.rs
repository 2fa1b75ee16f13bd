//! Integration tests for the agent API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use funk_agent_lib::{
    health::{components, HealthRegistry},
    observability::AgentMetrics,
    sync::UploadStats,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::DISCOVERY).await;
    health_registry.register(components::TRANSPORT).await;

    let upload_stats = Arc::new(RwLock::new(UploadStats::default()));
    let state = Arc::new(AppState::new(health_registry, upload_stats));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = tokio_test::assert_ok!(
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    );
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::TRANSPORT, "Send failed: broken pipe")
        .await;

    let (status, body) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["transport"]["message"],
        "Send failed: broken pipe"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::DISCOVERY, "Container event stream closed")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_first_connection() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::TRANSPORT, "Not connected")
        .await;

    let (status, _body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_status_reports_upload_counters() {
    let (app, state) = setup_test_app().await;

    {
        let mut stats = state.upload_stats.write().await;
        stats.batches_sent = 3;
        stats.messages_sent = 12;
        stats.send_failures = 1;
        stats.dropped_messages = 4;
        stats.last_error = Some("failed to send batch: broken pipe".to_string());
    }

    let (status, body) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);

    let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["trackers"], 0);
    assert_eq!(report["batches_sent"], 3);
    assert_eq!(report["messages_sent"], 12);
    assert_eq!(report["dropped_messages"], 4);
    assert_eq!(report["last_error"], "failed to send batch: broken pipe");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let metrics = AgentMetrics::new();
    metrics.set_trackers(2);
    metrics.record_batch_sent(5, 0.004);
    metrics.inc_send_failures();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("funk_agent_trackers"));
    assert!(metrics_text.contains("funk_agent_batches_sent_total"));
    assert!(metrics_text.contains("funk_agent_send_failures_total"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, _state) = setup_test_app().await;

    let metrics = AgentMetrics::new();
    metrics.record_batch_sent(1, 0.001);
    metrics.record_batch_sent(1, 0.02);

    let (_status, body) = get(app, "/metrics").await;
    let metrics_text = String::from_utf8(body).unwrap();

    assert!(metrics_text.contains("funk_agent_upload_latency_seconds_bucket"));
    assert!(metrics_text.contains("funk_agent_upload_latency_seconds_count"));
    assert!(metrics_text.contains("funk_agent_upload_latency_seconds_sum"));
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_status, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(health["components"].is_object());
    assert!(health["components"]["discovery"].is_object());
    assert!(health["components"]["transport"].is_object());
}
