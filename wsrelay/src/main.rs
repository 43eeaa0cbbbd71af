mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use wsrelay_cluster::{
    BusBridge, ConnectionRegistry, DrainController, DrainSettings, HeartbeatSettings,
    LeaderHeartbeat,
};
use wsrelay_core::{
    logging, Config, MemoryBus, MemoryStore, MessageBus, RedisBus, RedisStore, SharedStore,
};

use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(about = "Horizontally scalable WebSocket broadcast relay", long_about = None)]
struct Args {
    /// Path to a YAML/TOML/JSON config file
    #[arg(short, long)]
    config: Option<String>,
}

/// Unique identity of this process within the fleet
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let suffix = nanoid::nanoid!(6);

    format!("{hostname}-{}-{suffix}", std::process::id())
}

async fn connect_backends(config: &Config) -> Result<(Arc<dyn MessageBus>, Arc<dyn SharedStore>)> {
    if !config.redis_enabled() {
        info!("Redis not configured, running single-node with in-memory bus and store");
        return Ok((Arc::new(MemoryBus::new()), Arc::new(MemoryStore::new())));
    }

    let timeout = config.redis_timeout();
    let bus = RedisBus::connect(&config.redis.url, timeout)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect Redis bus: {e}"))?;
    let store = RedisStore::connect(&config.redis.url, timeout)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect Redis store: {e}"))?;
    info!(channel = %config.redis.channel, "Connected to Redis");

    Ok((Arc::new(bus), Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::discover(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    let node_id = generate_node_id();
    info!(node_id = %node_id, "wsrelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Shared bus and store
    let (bus, store) = connect_backends(&config).await?;

    // 5. Core components
    let registry = Arc::new(ConnectionRegistry::new());
    let bridge = Arc::new(BusBridge::new(
        bus.clone(),
        registry.clone(),
        config.redis.channel.clone(),
        config.bridge_poll_interval(),
    ));
    let drain = Arc::new(DrainController::new(
        registry,
        store.clone(),
        format!("{}{node_id}", config.drain.key_prefix),
        DrainSettings::from_config(&config.drain),
    ));
    let heartbeat = config.heartbeat.enabled.then(|| {
        Arc::new(LeaderHeartbeat::new(
            store,
            bus,
            config.redis.channel.clone(),
            node_id.clone(),
            HeartbeatSettings::from_config(&config.heartbeat),
        ))
    });

    // 6. Serve until the drain reaches a terminal state
    let server = RelayServer::new(config, node_id, bridge, drain, heartbeat);
    let outcome = server.run().await?;

    info!(outcome = %outcome, "Drain finished, exiting");
    // Exit does not wait on anything else still running
    std::process::exit(0);
}
