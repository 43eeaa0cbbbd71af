//! HTTP and WebSocket tests against an in-memory backend
//!
//! Run with: cargo test --test http_tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wsrelay_api::{create_router, AppState};
use wsrelay_cluster::{BusBridge, ConnectionRegistry, DrainController, DrainSettings};
use wsrelay_core::config::ServerConfig;
use wsrelay_core::{MemoryBus, MemoryStore};

fn app_state() -> AppState {
    let registry = Arc::new(ConnectionRegistry::new());
    let bridge = Arc::new(BusBridge::new(
        Arc::new(MemoryBus::new()),
        registry.clone(),
        "broadcast",
        Duration::from_millis(20),
    ));
    let drain = Arc::new(DrainController::new(
        registry,
        Arc::new(MemoryStore::new()),
        "shutdown:test-node".to_string(),
        DrainSettings::default(),
    ));
    AppState::new(bridge, drain, "test-node", &ServerConfig::default())
}

async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
    let response = create_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health_ok() {
    let (status, body) = get(app_state(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_ready_until_draining() {
    let state = app_state();
    let (status, _) = get(state.clone(), "/ready").await;
    assert_eq!(status, StatusCode::OK);

    state.drain.begin();
    let (status, body) = get(state.clone(), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "DRAINING");

    // Liveness is unaffected
    let (status, _) = get(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_stats_reports_node_and_state() {
    let state = app_state();
    state.drain.begin();

    let (status, body) = get(state, "/stats").await;
    assert_eq!(status, StatusCode::OK);

    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["node_id"], "test-node");
    assert_eq!(stats["connections"], 0);
    assert_eq!(stats["drain_state"], "draining");
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while state.registry.count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_websocket_relay_end_to_end() {
    let state = app_state();
    let cancel = CancellationToken::new();
    let subscriber = state.bridge.clone().start(cancel.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let url = format!("ws://{addr}/ws");
    let (mut alice, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut bob, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_connections(&state, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.send(Message::Text("hello".into())).await.unwrap();

    for client in [&mut alice, &mut bob] {
        let msg = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.to_text().unwrap(), "hello");
    }

    alice.close(None).await.unwrap();
    wait_for_connections(&state, 1).await;

    cancel.cancel();
    subscriber.await.unwrap();
}
