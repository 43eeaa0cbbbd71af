use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub bridge: BridgeConfig,
    pub drain: DrainConfig,
    pub heartbeat: HeartbeatConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum inbound WebSocket message size in bytes
    pub max_message_size: usize,
    /// Per-connection outbound queue depth
    pub send_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_message_size: 64 * 1024,
            send_buffer: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL selects single-node mode (in-memory bus and store)
    pub url: String,
    pub channel: String,
    pub timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://redis:6379".to_string(),
            channel: "broadcast".to_string(),
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub poll_interval_seconds: u64,
    pub record_ttl_seconds: u64,
    pub timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            record_ttl_seconds: 60,
            timeout_seconds: 30 * 60,
            key_prefix: "shutdown:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    pub lock_key: String,
    pub message: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
            lock_ttl_seconds: 9,
            lock_key: "periodic_broadcast_lock".to_string(),
            message: "🛰 Test notification".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // WSRELAY_REDIS__URL, WSRELAY_DRAIN__TIMEOUT_SECONDS, ...
        builder = builder.add_source(
            Environment::with_prefix("WSRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Resolve the config file (explicit path > `WSRELAY_CONFIG_PATH` > `./config.yaml`)
    /// and load it, falling back to environment variables only.
    pub fn discover(explicit_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(str::to_string)
            .or_else(|| std::env::var("WSRELAY_CONFIG_PATH").ok())
            .or_else(|| {
                let cwd = "config.yaml";
                Path::new(cwd).exists().then(|| cwd.to_string())
            });

        match path {
            Some(path) => Self::from_file(&path),
            None => Self::from_env(),
        }
    }

    /// Check cross-field constraints. Returns every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.redis.channel.is_empty() {
            errors.push("redis.channel must not be empty".to_string());
        }
        if self.redis.timeout_seconds == 0 {
            errors.push("redis.timeout_seconds must be greater than zero".to_string());
        }
        if self.server.send_buffer == 0 {
            errors.push("server.send_buffer must be greater than zero".to_string());
        }
        if self.bridge.poll_interval_ms == 0 {
            errors.push("bridge.poll_interval_ms must be greater than zero".to_string());
        }
        if self.drain.poll_interval_seconds == 0 {
            errors.push("drain.poll_interval_seconds must be greater than zero".to_string());
        }
        if self.drain.record_ttl_seconds <= self.drain.poll_interval_seconds {
            errors.push(format!(
                "drain.record_ttl_seconds ({}) must exceed drain.poll_interval_seconds ({})",
                self.drain.record_ttl_seconds, self.drain.poll_interval_seconds
            ));
        }
        if self.heartbeat.enabled {
            if self.heartbeat.lock_key.is_empty() {
                errors.push("heartbeat.lock_key must not be empty".to_string());
            }
            if self.heartbeat.lock_ttl_seconds == 0 {
                errors.push("heartbeat.lock_ttl_seconds must be greater than zero".to_string());
            }
            if self.heartbeat.lock_ttl_seconds >= self.heartbeat.interval_seconds {
                errors.push(format!(
                    "heartbeat.lock_ttl_seconds ({}) must be less than heartbeat.interval_seconds ({})",
                    self.heartbeat.lock_ttl_seconds, self.heartbeat.interval_seconds
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether a shared Redis is configured (multi-process mode)
    #[must_use]
    pub fn redis_enabled(&self) -> bool {
        !self.redis.url.is_empty()
    }

    /// Get HTTP listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub const fn redis_timeout(&self) -> Duration {
        Duration::from_secs(self.redis.timeout_seconds)
    }

    #[must_use]
    pub const fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge.poll_interval_ms)
    }
}
