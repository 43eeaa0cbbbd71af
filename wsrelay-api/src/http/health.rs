//! Health check endpoints
//!
//! `/health` is liveness and answers for as long as the process is up.
//! `/ready` turns unavailable once a drain starts so load balancers stop
//! routing new clients here.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use wsrelay_cluster::DrainState;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.drain.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "DRAINING")
    } else {
        (StatusCode::OK, "READY")
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub node_id: String,
    pub connections: usize,
    pub drain_state: DrainState,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_id: state.node_id.to_string(),
        connections: state.registry.count(),
        drain_state: state.drain.state(),
    })
}
