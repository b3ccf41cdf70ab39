//! Read-only observability endpoints (spec.md §6 "Observability
//! endpoints"): queue depth, pool metrics, and network stats. No mutation
//! permitted through any handler in this module.

use crate::api::AppState;
use crate::orchestrator::QueueStats;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /metrics — Prometheus text exposition format, gated behind the
/// `metrics` feature the same way `pool::metrics` is.
#[cfg(feature = "metrics")]
pub async fn metrics() -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, String::new())],
            Vec::new(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(not(feature = "metrics"))]
pub async fn metrics() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}

/// GET /stats/queue
pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.orchestrator.queue_stats())
}

/// GET /stats/pool
pub async fn pool_stats(State(state): State<AppState>) -> impl IntoResponse {
    let depth = state.orchestrator.queue_stats().depth as u64;
    Json(state.pool.metrics(depth))
}

#[derive(Debug, Serialize)]
pub struct NetworkStatsResponse {
    pub count: usize,
    pub names: Vec<String>,
}

/// GET /stats/network
pub async fn network_stats(State(state): State<AppState>) -> Json<NetworkStatsResponse> {
    let stats = state.network_manager.stats();
    Json(NetworkStatsResponse {
        count: stats.count,
        names: stats.names,
    })
}
