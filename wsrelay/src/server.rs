use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsrelay_api::{create_router, AppState};
use wsrelay_cluster::{BusBridge, DrainController, DrainState, LeaderHeartbeat};
use wsrelay_core::Config;

/// How long background loops get to observe cancellation
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    config: Config,
    node_id: String,
    bridge: Arc<BusBridge>,
    drain: Arc<DrainController>,
    heartbeat: Option<Arc<LeaderHeartbeat>>,
}

impl RelayServer {
    pub fn new(
        config: Config,
        node_id: String,
        bridge: Arc<BusBridge>,
        drain: Arc<DrainController>,
        heartbeat: Option<Arc<LeaderHeartbeat>>,
    ) -> Self {
        Self {
            config,
            node_id,
            bridge,
            drain,
            heartbeat,
        }
    }

    /// Serve until a shutdown signal, then drain
    ///
    /// Returns the terminal drain state. The HTTP listener stays up while
    /// draining; the caller is expected to exit the process right after.
    pub async fn run(self) -> Result<DrainState> {
        let cancel = CancellationToken::new();

        let mut background: Vec<(&'static str, JoinHandle<()>)> =
            vec![("bus subscriber", self.bridge.clone().start(cancel.clone()))];
        if let Some(heartbeat) = &self.heartbeat {
            background.push(("leader heartbeat", heartbeat.clone().start(cancel.clone())));
        } else {
            info!("Leader heartbeat disabled");
        }

        let addr: SocketAddr = self
            .config
            .http_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address: {e}"))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);

        let state = AppState::new(
            self.bridge.clone(),
            self.drain.clone(),
            self.node_id.as_str(),
            &self.config.server,
        );
        let app = create_router(state);

        let mut http = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
        });

        tokio::select! {
            () = shutdown_signal() => {}
            result = &mut http => {
                cancel.cancel();
                return match result {
                    Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
                    Ok(Err(e)) => Err(anyhow::anyhow!("HTTP server error: {e}")),
                    Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {e}")),
                };
            }
        }

        info!("Graceful shutdown initiated");

        // 1. Enter Draining before anything else so disconnects hold
        self.drain.begin();

        // 2. Stop the bus subscriber and heartbeat
        cancel.cancel();
        for (name, handle) in background {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("{} stopped", name),
                Ok(Err(e)) => error!("{} task failed: {}", name, e),
                Err(_) => warn!("{} did not stop within {}s", name, TASK_SHUTDOWN_TIMEOUT.as_secs()),
            }
        }

        // 3. Wait for active connections to drain (with timeout)
        let outcome = self.drain.run().await;
        match outcome {
            DrainState::Drained => info!("Drain complete"),
            state => warn!(state = %state, "Drain ended with connection(s) still active"),
        }

        Ok(outcome)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
