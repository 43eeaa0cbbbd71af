use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsrelay_core::{BusSubscription, MessageBus};

use super::drain::DrainController;
use super::registry::{Connection, ConnectionRegistry};
use crate::error::Result;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Inbound half of a client connection
#[async_trait]
pub trait InboundStream: Send {
    /// Next text message from the client.
    ///
    /// `None` on a clean disconnect, `Some(Err)` on a read failure.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Why a connection's receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed the connection
    Disconnected,
    /// Reading from the client failed
    ReadFailed,
    /// Forwarding a client message to the bus failed
    PublishFailed,
    /// Removed from the registry elsewhere, typically after a failed send
    Removed,
}

/// How the subscriber loop exited
enum SubscriberExit {
    Cancelled,
    /// The subscription was lost and must be re-established
    Disconnected,
}

/// Couples local connections to the shared bus channel
///
/// Every message received on the channel is broadcast to the local
/// `ConnectionRegistry`; every message a local client sends is published on
/// the channel verbatim. The bus does not know the originator, so a client
/// receives its own messages back.
pub struct BusBridge {
    bus: Arc<dyn MessageBus>,
    registry: Arc<ConnectionRegistry>,
    channel: String,
    poll_interval: Duration,
}

impl BusBridge {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<ConnectionRegistry>,
        channel: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            channel: channel.into(),
            poll_interval,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Forward a client message to the bus channel
    ///
    /// A failure is returned to the caller, which closes the originating
    /// connection. Nothing is retried here.
    pub async fn publish(&self, message: &str) -> Result<usize> {
        let receivers = self.bus.publish(&self.channel, message).await?;
        debug!(channel = %self.channel, receivers = receivers, "Message published to bus");
        Ok(receivers)
    }

    /// Spawn the subscriber loop
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Subscribe to the channel and relay messages until cancelled
    ///
    /// A lost subscription is re-established with exponential backoff.
    /// Cancellation is the only way out.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                info!("Bus subscriber cancelled");
                return;
            }

            match self.bus.subscribe(&self.channel).await {
                Ok(subscription) => {
                    info!(channel = %self.channel, "Subscribed to bus channel");
                    match self.pump(subscription, &cancel).await {
                        SubscriberExit::Cancelled => return,
                        SubscriberExit::Disconnected => {
                            // Subscription was healthy before it dropped
                            backoff = INITIAL_BACKOFF;
                            error!(
                                channel = %self.channel,
                                backoff_secs = backoff.as_secs(),
                                "Bus subscription lost, resubscribing"
                            );
                        }
                    }
                }
                Err(e) => {
                    error!(
                        channel = %self.channel,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Failed to subscribe to bus channel, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Bus subscriber cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn pump(
        &self,
        mut subscription: Box<dyn BusSubscription>,
        cancel: &CancellationToken,
    ) -> SubscriberExit {
        while !cancel.is_cancelled() {
            match subscription.next_message(self.poll_interval).await {
                Ok(Some(payload)) => {
                    let result = self.registry.broadcast(&payload);
                    debug!(
                        channel = %self.channel,
                        delivered = result.delivered,
                        removed = result.removed,
                        "Forwarded bus message to local connections"
                    );
                }
                Ok(None) => {}
                Err(e) if e.is_subscription_lost() => return SubscriberExit::Disconnected,
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Failed to fetch next bus message");
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(channel = %self.channel, error = %e, "Failed to unsubscribe from bus channel");
        }
        info!(channel = %self.channel, "Bus subscriber stopped");
        SubscriberExit::Cancelled
    }

    /// Register `connection` and relay its inbound messages to the bus until
    /// it closes
    ///
    /// Must be called once the connection's handshake has completed. The loop
    /// also ends when the registry drops the connection, so the caller can
    /// close the transport instead of keeping a half-open peer. When the
    /// client goes away while a drain is in progress, the handling context is
    /// held until the drain has been signalled before the connection leaves
    /// the registry.
    pub async fn serve_connection<S>(
        &self,
        connection: Connection,
        inbound: &mut S,
        drain: &DrainController,
    ) -> CloseReason
    where
        S: InboundStream + ?Sized,
    {
        self.registry.add(connection.clone());

        let reason = loop {
            let next = tokio::select! {
                () = connection.removed() => {
                    info!(connection_id = %connection.id(), "Connection removed from registry, closing");
                    break CloseReason::Removed;
                }
                next = inbound.recv() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if let Err(e) = self.publish(&message).await {
                        warn!(
                            connection_id = %connection.id(),
                            error = %e,
                            "Failed to publish client message, closing connection"
                        );
                        break CloseReason::PublishFailed;
                    }
                }
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id(), error = %e, "Connection read failed");
                    break CloseReason::ReadFailed;
                }
                None => break CloseReason::Disconnected,
            }
        };

        if drain.is_draining() {
            info!(
                connection_id = %connection.id(),
                "Graceful shutdown: keeping connection context until drain is signalled"
            );
            drain.started().await;
        }

        self.registry.remove(connection.id());
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sync::drain::DrainSettings;
    use crate::sync::registry::ChannelSender;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use wsrelay_core::{MemoryBus, MemoryStore};

    const POLL: Duration = Duration::from_millis(20);

    /// Scripted client: yields queued items, then the final outcome
    struct ScriptedInbound {
        items: VecDeque<Option<Result<String>>>,
    }

    impl ScriptedInbound {
        fn new(items: Vec<Option<Result<String>>>) -> Self {
            Self {
                items: items.into(),
            }
        }
    }

    #[async_trait]
    impl InboundStream for ScriptedInbound {
        async fn recv(&mut self) -> Option<Result<String>> {
            self.items.pop_front().flatten()
        }
    }

    /// Client backed by a channel; dropping the sender disconnects it
    struct ChannelInbound(mpsc::Receiver<String>);

    #[async_trait]
    impl InboundStream for ChannelInbound {
        async fn recv(&mut self) -> Option<Result<String>> {
            self.0.recv().await.map(Ok)
        }
    }

    /// Bus whose publish always fails
    struct BrokenBus;

    #[async_trait]
    impl MessageBus for BrokenBus {
        async fn publish(&self, _channel: &str, _payload: &str) -> wsrelay_core::Result<usize> {
            Err(wsrelay_core::Error::Timeout("publish timed out".to_string()))
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> wsrelay_core::Result<Box<dyn BusSubscription>> {
            Err(wsrelay_core::Error::SubscriptionClosed(channel.to_string()))
        }
    }

    fn drain_controller(registry: Arc<ConnectionRegistry>) -> DrainController {
        DrainController::new(
            registry,
            Arc::new(MemoryStore::new()),
            "shutdown:test".to_string(),
            DrainSettings::default(),
        )
    }

    fn channel_connection() -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Connection::new(None, Arc::new(ChannelSender::new(tx))), rx)
    }

    #[tokio::test]
    async fn test_bus_message_is_broadcast_locally() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BusBridge::new(bus.clone(), registry.clone(), "broadcast", POLL));

        let (conn, mut rx) = channel_connection();
        registry.add(conn);

        let cancel = CancellationToken::new();
        let handle = bridge.clone().start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish("broadcast", "from the bus").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("from the bus"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_subscriber_within_poll_interval() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BusBridge::new(bus, registry, "broadcast", POLL));

        let cancel = CancellationToken::new();
        let handle = bridge.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        cancel.cancel();
        assert!(tokio::time::timeout(POLL * 5, handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_message_is_published_and_echoed() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BusBridge::new(bus.clone(), registry.clone(), "broadcast", POLL));
        let drain = drain_controller(registry.clone());

        let cancel = CancellationToken::new();
        let handle = bridge.clone().start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (conn, mut rx) = channel_connection();
        let (client_tx, client_rx) = mpsc::channel::<String>(4);

        let serve_bridge = bridge.clone();
        let serve = tokio::spawn(async move {
            let mut inbound = ChannelInbound(client_rx);
            serve_bridge.serve_connection(conn, &mut inbound, &drain).await
        });

        client_tx.send("hi all".to_string()).await.unwrap();

        // The sender's own connection receives the echo from the bus
        let echoed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(echoed.as_deref(), Some("hi all"));

        drop(client_tx);
        let reason = serve.await.unwrap();
        assert_eq!(reason, CloseReason::Disconnected);
        assert_eq!(registry.count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_removes_connection() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BusBridge::new(bus, registry.clone(), "broadcast", POLL);
        let drain = drain_controller(registry.clone());

        let (conn, _rx) = channel_connection();
        let mut inbound = ScriptedInbound::new(vec![
            Some(Ok("one".to_string())),
            Some(Err(Error::Read("connection reset".to_string()))),
        ]);

        let reason = bridge.serve_connection(conn, &mut inbound, &drain).await;
        assert_eq!(reason, CloseReason::ReadFailed);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_closes_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BusBridge::new(Arc::new(BrokenBus), registry.clone(), "broadcast", POLL);
        let drain = drain_controller(registry.clone());

        let (conn, _rx) = channel_connection();
        let mut inbound = ScriptedInbound::new(vec![
            Some(Ok("one".to_string())),
            Some(Ok("two".to_string())),
        ]);

        let reason = bridge.serve_connection(conn, &mut inbound, &drain).await;
        assert_eq!(reason, CloseReason::PublishFailed);
        assert_eq!(registry.count(), 0);
        // The second message was never read
        assert_eq!(inbound.items.len(), 1);
    }

    #[tokio::test]
    async fn test_pruned_connection_stops_relaying() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("broadcast").await.unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BusBridge::new(bus, registry.clone(), "broadcast", POLL));
        let drain = drain_controller(registry.clone());

        // Queue of one that is never drained: the second broadcast fails
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(None, Arc::new(ChannelSender::new(tx)));
        let (client_tx, client_rx) = mpsc::channel::<String>(4);

        let serve = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let mut inbound = ChannelInbound(client_rx);
                bridge.serve_connection(conn, &mut inbound, &drain).await
            }
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        registry.broadcast("one");
        assert_eq!(registry.broadcast("two").removed, 1);

        let reason = tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::Removed);

        // Nothing the client sends afterwards reaches the bus
        let _ = client_tx.send("still talking".to_string()).await;
        assert!(sub.next_message(POLL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_during_drain_is_released() {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BusBridge::new(bus, registry.clone(), "broadcast", POLL);
        let drain = drain_controller(registry.clone());
        assert!(drain.begin());

        let (conn, _rx) = channel_connection();
        let mut inbound = ScriptedInbound::new(vec![None]);

        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            bridge.serve_connection(conn, &mut inbound, &drain),
        )
        .await
        .unwrap();
        assert_eq!(reason, CloseReason::Disconnected);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_retries_until_cancelled() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BusBridge::new(Arc::new(BrokenBus), registry, "broadcast", POLL));

        let cancel = CancellationToken::new();
        let handle = bridge.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
    }
}
