//! Health and metrics endpoint
//!
//! Off by default. When enabled it serves `/healthz` (200 unless a pipeline
//! component is unhealthy), `/readyz` (200 while the detection loop runs) and
//! `/metrics` in the Prometheus text format.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use sentinel_lib::{cycle::ShutdownSignal, health::HealthRegistry, observability::SentinelMetrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// State shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SentinelMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: SentinelMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health_registry.report().await;
    let code = if report.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health_registry.readiness().await;
    let code = match readiness.ready {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(readiness)).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the endpoint on all interfaces until a stop is requested
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health and metrics endpoint listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.requested().await })
        .await?;

    info!("Health and metrics endpoint stopped");
    Ok(())
}
