//! Shared key-value store with per-key expiry
//!
//! Backs the fleet-wide leader lock and the per-process drain record.
//! Uses Redis `SET NX PX` for atomic "set if absent" acquisition.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{timeout, Instant};

use crate::{Error, Result};

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically set `key` only if it does not exist. Returns `true` when
    /// this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditionally set `key` with a fresh expiry
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Millisecond expiry for `PX`, never zero (Redis rejects a zero expiry)
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;
        Ok(Self { conn, op_timeout })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        // SET key value NX PX ttl
        let result: Option<String> = timeout(
            self.op_timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout(format!("SET NX {key} timed out")))??;

        Ok(result.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        timeout(self.op_timeout, conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)))
            .await
            .map_err(|_| Error::Timeout(format!("SET {key} timed out")))??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        timeout(self.op_timeout, conn.del::<_, i64>(key))
            .await
            .map_err(|_| Error::Timeout(format!("DEL {key} timed out")))??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = timeout(self.op_timeout, conn.get(key))
            .await
            .map_err(|_| Error::Timeout(format!("GET {key} timed out")))??;
        Ok(value)
    }
}

/// In-process store with lazy expiry
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
