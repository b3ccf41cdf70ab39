//! HTTP/WebSocket transport for the orchestrator: the streaming channel
//! (`/ws`), the request/response channel (`POST /execute`), and the
//! read-only observability endpoints (spec.md §6).

pub mod execute;
pub mod stats;
pub mod ws;

use crate::config::Config;
use crate::net::NetworkManager;
use crate::orchestrator::Orchestrator;
use crate::pool::ContainerPool;
use crate::session::SessionRegistry;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler, mirroring the teacher's
/// `ApiState`-based router construction
/// (`Router::new().route(...).with_state(state)`).
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<ContainerPool>,
    pub network_manager: Arc<NetworkManager>,
    pub sessions: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/execute", post(execute::execute_handler))
        .route("/health", get(stats::health_check))
        .route("/metrics", get(stats::metrics))
        .route("/stats/queue", get(stats::queue_stats))
        .route("/stats/pool", get(stats::pool_stats))
        .route("/stats/network", get(stats::network_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
