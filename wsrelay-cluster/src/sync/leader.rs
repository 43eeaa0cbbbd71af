use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsrelay_core::config::HeartbeatConfig;
use wsrelay_core::{MessageBus, SharedStore};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    /// Must stay below `interval` so a crashed leader frees the lock within one tick
    pub lock_ttl: Duration,
    pub lock_key: String,
    pub message: String,
}

impl HeartbeatSettings {
    #[must_use]
    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
            lock_key: config.lock_key.clone(),
            message: config.message.clone(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self::from_config(&HeartbeatConfig::default())
    }
}

/// Fleet-wide periodic heartbeat, published by whichever process wins the
/// lock for the current tick
///
/// The lock is never released explicitly. It expires on its own and the next
/// tick is open to every process.
pub struct LeaderHeartbeat {
    store: Arc<dyn SharedStore>,
    bus: Arc<dyn MessageBus>,
    channel: String,
    node_id: String,
    settings: HeartbeatSettings,
}

impl LeaderHeartbeat {
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
        node_id: impl Into<String>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            store,
            bus,
            channel: channel.into(),
            node_id: node_id.into(),
            settings,
        }
    }

    /// Try to lead this tick. Returns `true` if this process won the lock and
    /// published the heartbeat.
    pub async fn tick(&self) -> Result<bool> {
        let acquired = self
            .store
            .set_if_absent(&self.settings.lock_key, &self.node_id, self.settings.lock_ttl)
            .await?;

        if !acquired {
            debug!(lock_key = %self.settings.lock_key, "Heartbeat lock held by another process");
            return Ok(false);
        }

        let receivers = self.bus.publish(&self.channel, &self.settings.message).await?;
        info!(
            node_id = %self.node_id,
            channel = %self.channel,
            receivers = receivers,
            "Published heartbeat as leader"
        );
        Ok(true)
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Tick on the configured interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.settings.interval.as_secs(),
            lock_ttl_secs = self.settings.lock_ttl.as_secs(),
            "Leader heartbeat started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Leader heartbeat shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Heartbeat tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsrelay_core::{BusSubscription, MemoryBus, MemoryStore};

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(9),
            lock_key: "periodic_broadcast_lock".to_string(),
            message: "heartbeat".to_string(),
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = HeartbeatSettings::default();
        assert!(settings.lock_ttl < settings.interval);
        assert_eq!(settings.lock_key, "periodic_broadcast_lock");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_publishes_when_lock_is_free() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("broadcast").await.unwrap();
        let heartbeat = LeaderHeartbeat::new(
            Arc::new(MemoryStore::new()),
            bus.clone(),
            "broadcast",
            "node-a",
            settings(),
        );

        assert!(heartbeat.tick().await.unwrap());
        let received = sub.next_message(Duration::from_millis(10)).await.unwrap();
        assert_eq!(received.as_deref(), Some("heartbeat"));

        // Lock still held within the TTL
        assert!(!heartbeat.tick().await.unwrap());
        assert!(sub.next_message(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let heartbeat = Arc::new(LeaderHeartbeat::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBus::new()),
            "broadcast",
            "node-a",
            settings(),
        ));

        let cancel = CancellationToken::new();
        let handle = heartbeat.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(25)).await;

        cancel.cancel();
        handle.await.unwrap();
    }
}
