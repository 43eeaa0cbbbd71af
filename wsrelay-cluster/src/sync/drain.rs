//! Graceful, deadline-bounded drain on shutdown
//!
//! While draining, the process publishes its remaining connection count to
//! the shared store under a TTL so an external fleet manager can watch drain
//! progress. A record that expires without refresh means the process died
//! mid-drain.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsrelay_core::config::DrainConfig;
use wsrelay_core::SharedStore;

use super::registry::ConnectionRegistry;

/// Upper bound on a single shared store call made by the drain loop
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain lifecycle. `Drained` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Running,
    Draining,
    Drained,
    TimedOut,
}

impl DrainState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Drained | Self::TimedOut)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Drained => "drained",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// How often the count is published and evaluated
    pub poll_interval: Duration,
    /// Expiry of the shared heartbeat record
    pub record_ttl: Duration,
    /// Deadline measured from the start of the drain
    pub timeout: Duration,
}

impl DrainSettings {
    #[must_use]
    pub const fn from_config(config: &DrainConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            record_ttl: Duration::from_secs(config.record_ttl_seconds),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self::from_config(&DrainConfig::default())
    }
}

/// Drives the Running -> Draining -> Drained | TimedOut state machine
pub struct DrainController {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn SharedStore>,
    record_key: String,
    settings: DrainSettings,
    state: watch::Sender<DrainState>,
    /// Triggered once the drain has been signalled
    started: CancellationToken,
    running: AtomicBool,
}

impl DrainController {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn SharedStore>,
        record_key: String,
        settings: DrainSettings,
    ) -> Self {
        let (state, _) = watch::channel(DrainState::Running);
        Self {
            registry,
            store,
            record_key,
            settings,
            state,
            started: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    /// `true` from the moment the drain is signalled, including terminal states
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.started.is_cancelled()
    }

    #[must_use]
    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    /// Signal the drain. Returns `false` if it had already been signalled.
    pub fn begin(&self) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == DrainState::Running {
                *state = DrainState::Draining;
                true
            } else {
                false
            }
        });

        if transitioned {
            self.started.cancel();
            info!(
                connections = self.registry.count(),
                timeout_secs = self.settings.timeout.as_secs(),
                "Drain started"
            );
        }
        transitioned
    }

    /// Resolves once the drain has been signalled
    pub async fn started(&self) {
        self.started.cancelled().await;
    }

    /// Run the drain loop to a terminal state
    ///
    /// Signals the drain first if that has not happened yet. A second caller
    /// waits for the first one's outcome instead of running a parallel loop.
    /// The shared record is deleted on every exit path; a failed delete is
    /// logged and does not delay the result.
    pub async fn run(&self) -> DrainState {
        self.begin();

        if self.running.swap(true, Ordering::AcqRel) {
            let mut rx = self.state.subscribe();
            return match rx.wait_for(|state| state.is_terminal()).await {
                Ok(state) => *state,
                Err(_) => self.state(),
            };
        }

        let deadline = Instant::now() + self.settings.timeout;

        let outcome = loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    connections = self.registry.count(),
                    "Drain timeout reached with connection(s) still active, proceeding with shutdown"
                );
                break DrainState::TimedOut;
            }

            let count = self.registry.count();
            self.write_record(count).await;

            if count == 0 {
                info!("All connections drained");
                break DrainState::Drained;
            }

            let remaining = deadline - now;
            info!(
                connections = count,
                remaining_secs = remaining.as_secs(),
                "Waiting for active connection(s) to drain"
            );
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        };

        self.delete_record().await;
        self.state.send_replace(outcome);
        outcome
    }

    async fn write_record(&self, count: usize) {
        let result = timeout(
            STORE_TIMEOUT,
            self.store
                .set(&self.record_key, &count.to_string(), self.settings.record_ttl),
        )
        .await;

        match result {
            Ok(Ok(())) => debug!(key = %self.record_key, connections = count, "Drain record refreshed"),
            Ok(Err(e)) => warn!(key = %self.record_key, error = %e, "Failed to write drain record"),
            Err(_) => warn!(key = %self.record_key, "Writing drain record timed out"),
        }
    }

    async fn delete_record(&self) {
        match timeout(STORE_TIMEOUT, self.store.delete(&self.record_key)).await {
            Ok(Ok(())) => debug!(key = %self.record_key, "Drain record deleted"),
            Ok(Err(e)) => warn!(key = %self.record_key, error = %e, "Failed to delete drain record"),
            Err(_) => warn!(key = %self.record_key, "Deleting drain record timed out"),
        }
    }
}
