//! Relay WebSocket handler
//!
//! Each upgraded socket is split: a writer task drains the connection's
//! bounded outbound queue into the sink, while the read half feeds
//! `BusBridge::serve_connection`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wsrelay_cluster::sync::ChannelSender;
use wsrelay_cluster::{Connection, InboundStream};

use crate::http::AppState;

/// Adapts the read half of a WebSocket to `InboundStream`
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl InboundStream for WebSocketStream {
    async fn recv(&mut self) -> Option<wsrelay_cluster::Result<String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(wsrelay_cluster::Error::Read(format!("WebSocket error: {e}"))))
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(len = bytes.len(), "Ignoring binary frame");
                }
                // Ping/pong are answered by the transport
                Some(Ok(_)) => {}
            }
        }
    }
}

/// `GET /ws`
///
/// Accepts unconditionally, also while draining.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (tx, mut rx) = mpsc::channel::<String>(state.send_buffer);
    let (mut sink, receiver) = socket.split();

    let connection = Connection::new(Some(remote_addr), Arc::new(ChannelSender::new(tx)));
    let connection_id = connection.id().to_string();

    // Ends once every sender clone is dropped, i.e. after the connection
    // has left the registry
    tokio::spawn({
        let connection_id = connection_id.clone();
        async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(connection_id = %connection_id, error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
            let _ = sink.close().await;
        }
    });

    info!(connection_id = %connection_id, peer = %remote_addr, "WebSocket connection established");

    let mut stream = WebSocketStream { receiver };
    let reason = state
        .bridge
        .serve_connection(connection, &mut stream, &state.drain)
        .await;

    info!(
        connection_id = %connection_id,
        peer = %remote_addr,
        reason = ?reason,
        "WebSocket connection closed"
    );
}
