//! HTTP surface of the relay
//!
//! `GET /ws` upgrades to the relay WebSocket. `/health`, `/ready` and
//! `/stats` are probes for the process manager.

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use wsrelay_cluster::{BusBridge, ConnectionRegistry, DrainController};
use wsrelay_core::config::ServerConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<BusBridge>,
    pub drain: Arc<DrainController>,
    pub node_id: Arc<str>,
    pub max_message_size: usize,
    pub send_buffer: usize,
}

impl AppState {
    #[must_use]
    pub fn new(
        bridge: Arc<BusBridge>,
        drain: Arc<DrainController>,
        node_id: impl Into<Arc<str>>,
        server: &ServerConfig,
    ) -> Self {
        Self {
            registry: bridge.registry().clone(),
            bridge,
            drain,
            node_id: node_id.into(),
            max_message_size: server.max_message_size,
            send_buffer: server.send_buffer,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .with_state(state)
}
