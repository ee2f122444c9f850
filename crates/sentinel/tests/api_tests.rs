//! Integration tests for the sentinel API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use flow_sentinel::api::{create_router, AppState};
use sentinel_lib::{
    health::{Component, HealthRegistry, UNHEALTHY_AFTER_FAILURES},
    observability::SentinelMetrics,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register_pipeline().await;

    let metrics = SentinelMetrics::new();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

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
    assert_eq!(health["running"], false);
    assert_eq!(health["cycles_emitted"], 0);
}

#[tokio::test]
async fn test_healthz_reports_emitted_cycles() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_running(true).await;
    state.health_registry.record_emit().await;

    let (_, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["running"], true);
    assert_eq!(health["cycles_emitted"], 1);
    assert!(health["last_emit_at"].is_i64());
}

#[tokio::test]
async fn test_healthz_returns_ok_after_aborted_cycle() {
    let (app, state) = setup_test_app().await;

    // A recoverable stage failure only degrades the component
    state
        .health_registry
        .record_failure(Component::Extractor, "extractor timed out after 30s")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["extractor"]["message"],
        "extractor timed out after 30s"
    );
    assert_eq!(health["components"]["extractor"]["consecutive_failures"], 1);
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    for _ in 0..UNHEALTHY_AFTER_FAILURES {
        state
            .health_registry
            .record_failure(Component::Capture, "interface eth0 is down")
            .await;
    }

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_healthz_includes_pipeline_components() {
    let (app, _state) = setup_test_app().await;

    let (_, body) = get(app, "/healthz").await;
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    for name in ["capture", "extractor", "predictor", "emitter"] {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
}

#[tokio::test]
async fn test_readyz_returns_503_before_loop_starts() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_while_running() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_running(true).await;

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_running_but_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_running(true).await;
    for _ in 0..UNHEALTHY_AFTER_FAILURES {
        state
            .health_registry
            .record_failure(Component::Emitter, "stdout closed")
            .await;
    }

    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["reason"], "emitter is unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.inc_cycles("emitted");
    state.metrics.inc_stage_error("extraction");
    state.metrics.set_flows_aligned(7);
    state.metrics.inc_prediction("DDoS");
    state.metrics.set_classifiers_loaded(3);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("flow_sentinel_cycles_total{outcome=\"emitted\"}"));
    assert!(metrics_text.contains("flow_sentinel_stage_errors_total{stage=\"extraction\"}"));
    assert!(metrics_text.contains("flow_sentinel_flows_aligned"));
    assert!(metrics_text.contains("flow_sentinel_predictions_total{label=\"DDoS\"}"));
    assert!(metrics_text.contains("flow_sentinel_classifiers_loaded 3"));
}

#[tokio::test]
async fn test_metrics_contains_histogram_buckets() {
    let (app, state) = setup_test_app().await;

    state
        .metrics
        .observe_cycle_duration(Duration::from_millis(6200));
    state
        .metrics
        .observe_stage_duration("capture", Duration::from_secs(5));

    let (_, body) = get(app, "/metrics").await;
    let metrics_text = String::from_utf8(body).unwrap();

    assert!(metrics_text.contains("flow_sentinel_cycle_duration_seconds_bucket"));
    assert!(metrics_text.contains("flow_sentinel_cycle_duration_seconds_count"));
    assert!(metrics_text.contains("flow_sentinel_cycle_duration_seconds_sum"));
    assert!(metrics_text.contains("flow_sentinel_stage_duration_seconds_bucket{stage=\"capture\""));
}
