//! Publish/subscribe bus shared by every relay process
//!
//! The bus gives at-least-once delivery to live subscribers, no persistence
//! and no ordering across publishers. `RedisBus` is the multi-process
//! backend; `MemoryBus` serves single-node deployments and tests.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::debug;

use crate::{Error, Result};

/// Publish side of the bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `channel`. Returns the number of subscribers
    /// that received it, as reported by the backend.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Open a new subscription to `channel`
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>>;
}

/// A live subscription to a single channel
#[async_trait]
pub trait BusSubscription: Send {
    /// Wait up to `wait` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. `Error::SubscriptionClosed`
    /// means the subscription is gone and must be re-established.
    async fn next_message(&mut self, wait: Duration) -> Result<Option<String>>;

    /// Unsubscribe and release the underlying connection
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// Redis Pub/Sub backed bus
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: RedisConnectionManager,
    op_timeout: Duration,
}

impl RedisBus {
    /// Connect to Redis. Every later operation is bounded by `op_timeout`.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = timeout(self.op_timeout, conn.publish(channel, payload))
            .await
            .map_err(|_| Error::Timeout(format!("Publishing to {channel} timed out")))??;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>> {
        let mut pubsub = timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| Error::Timeout("Redis Pub/Sub connection timed out".to_string()))??;

        timeout(self.op_timeout, pubsub.subscribe(channel))
            .await
            .map_err(|_| Error::Timeout(format!("Subscribing to {channel} timed out")))??;

        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
            op_timeout: self.op_timeout,
        }))
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
    op_timeout: Duration,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<String>> {
        let next = match timeout(wait, self.pubsub.on_message().next()).await {
            Ok(next) => next,
            Err(_) => return Ok(None),
        };

        // The message stream ends when the Redis connection is lost
        let msg = next.ok_or_else(|| Error::SubscriptionClosed(self.channel.clone()))?;
        let payload: String = msg
            .get_payload()
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;
        Ok(Some(payload))
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        timeout(this.op_timeout, this.pubsub.unsubscribe(&this.channel))
            .await
            .map_err(|_| Error::Timeout(format!("Unsubscribing from {} timed out", this.channel)))??;
        debug!(channel = %this.channel, "Unsubscribed from Redis channel");
        Ok(())
    }
}

/// In-process bus built on tokio broadcast channels
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl MemoryBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        // No live subscriber is not an error, matching Redis PUBLISH returning 0
        Ok(self.sender(channel).send(payload.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BusSubscription>> {
        Ok(Box::new(MemorySubscription {
            receiver: self.sender(channel).subscribe(),
            channel: channel.to_string(),
        }))
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
    channel: String,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<String>> {
        match timeout(wait, self.receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => Err(Error::Internal(
                format!("Subscriber on {} lagged, {skipped} message(s) dropped", self.channel),
            )),
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                Err(Error::SubscriptionClosed(self.channel.clone()))
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        debug!(channel = %self.channel, "Unsubscribed from in-memory channel");
        Ok(())
    }
}
