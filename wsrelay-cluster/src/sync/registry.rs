use indexmap::IndexMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Handle for a client connection
pub type ConnectionId = String;

/// Outbound half of a client connection
pub trait MessageSender: Send + Sync {
    /// Deliver a text message to the peer. Fails when the peer is gone.
    fn send(&self, message: &str) -> Result<()>;
}

/// Sender backed by a bounded queue drained by the connection's writer task
///
/// A full queue means the client is too slow to keep up and is treated the
/// same as a dead peer.
pub struct ChannelSender {
    sender: mpsc::Sender<String>,
}

impl ChannelSender {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, message: &str) -> Result<()> {
        self.sender
            .try_send(message.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::SendFailed("Channel full: client too slow to consume messages".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::SendFailed("Channel closed: client disconnected".to_string())
                }
            })
    }
}

/// A single client's endpoint and liveness state
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    sender: Arc<dyn MessageSender>,
    /// Cancelled once the connection leaves its registry
    removed: CancellationToken,
}

impl Connection {
    #[must_use]
    pub fn new(remote_addr: Option<SocketAddr>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            id: nanoid::nanoid!(12),
            remote_addr,
            sender,
            removed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// `false` once the connection has been removed from its registry
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.removed.is_cancelled()
    }

    /// Resolves once the connection has been removed, including by a failed
    /// broadcast send
    pub async fn removed(&self) {
        self.removed.cancelled().await;
    }

    pub fn send(&self, message: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ConnectionRemoved(self.id.clone()));
        }
        self.sender.send(message)
    }

    fn mark_removed(&self) {
        self.removed.cancel();
    }

    fn peer(&self) -> String {
        self.remote_addr
            .map_or_else(|| "unknown client".to_string(), |addr| addr.to_string())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Outcome of a single broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Connections the message was handed to
    pub delivered: usize,
    /// Connections whose send failed and were removed
    pub removed: usize,
}

/// Tracks every connection owned by this process
///
/// add/remove and broadcast's removals are serialized by one lock. `count`
/// reads an atomic kept in step with the map under that lock, so it never
/// waits on a broadcast in progress.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<IndexMap<ConnectionId, Connection>>,
    count: AtomicUsize,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection whose handshake has completed
    pub fn add(&self, connection: Connection) {
        if !connection.is_alive() {
            warn!(connection_id = %connection.id, "Refusing to register a removed connection");
            return;
        }

        let mut connections = self.connections.lock();
        if connections.contains_key(&connection.id) {
            warn!(connection_id = %connection.id, "Connection already registered");
            return;
        }

        let peer = connection.peer();
        let connection_id = connection.id.clone();
        connections.insert(connection_id.clone(), connection);
        let total = connections.len();
        self.count.store(total, Ordering::Release);
        drop(connections);

        info!(connection_id = %connection_id, peer = %peer, total = total, "Connection registered");
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock();
        let Some(connection) = connections.shift_remove(connection_id) else {
            return false;
        };
        connection.mark_removed();
        let total = connections.len();
        self.count.store(total, Ordering::Release);
        drop(connections);

        info!(connection_id = %connection_id, peer = %connection.peer(), total = total, "Connection removed");
        true
    }

    /// Send `message` to every registered connection, best-effort
    ///
    /// Works on a snapshot taken at call time. A connection whose send fails
    /// is presumed dead and removed; the remaining connections are still
    /// served.
    pub fn broadcast(&self, message: &str) -> BroadcastResult {
        let snapshot: Vec<Connection> = self.connections.lock().values().cloned().collect();

        let mut result = BroadcastResult::default();
        let mut failed = Vec::new();

        for connection in &snapshot {
            // Removed by another caller after the snapshot was taken
            if !connection.is_alive() {
                continue;
            }

            match connection.send(message) {
                Ok(()) => result.delivered += 1,
                Err(Error::ConnectionRemoved(_)) => {}
                Err(e) => {
                    warn!(
                        connection_id = %connection.id,
                        peer = %connection.peer(),
                        error = %e,
                        "Error sending to connection, removing"
                    );
                    failed.push(connection.id.clone());
                }
            }
        }

        for connection_id in &failed {
            if self.remove(connection_id) {
                result.removed += 1;
            }
        }

        debug!(
            delivered = result.delivered,
            removed = result.removed,
            "Broadcast complete"
        );

        result
    }

    /// Number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether `connection_id` is currently registered
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.lock().contains_key(connection_id)
    }
}
