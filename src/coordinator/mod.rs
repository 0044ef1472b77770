//! Thin client over the coordinator's atomic primitives.
//!
//! Every cross-process interaction in the fleet goes through the [`Kv`]
//! trait: plain get/set, conditional set with TTL (first lock acquisition),
//! atomic get-and-set (lock takeover and refresh), and delete. No protocol
//! logic lives here; callers compose these primitives.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use memory::MemoryKv;
pub use redis::RedisKv;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Atomic key-value primitives offered by the coordinator.
///
/// Single-key operations are linearizable; nothing here spans keys.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinatorError>;

    /// Unconditional write without TTL.
    async fn set(&self, key: &str, value: &str) -> Result<(), CoordinatorError>;

    /// Set `key` to `value` with `ttl` only if the key does not exist.
    /// Returns whether the write happened.
    async fn acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError>;

    /// Atomic get-and-set. Returns the previous value, `None` iff the key
    /// was absent. The new value carries no TTL.
    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, CoordinatorError>;

    /// Unconditional write with TTL. Only a confirmed lock holder calls this.
    async fn refresh(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CoordinatorError>;

    async fn delete(&self, key: &str) -> Result<(), CoordinatorError>;

    /// Keys currently present under a prefix. Backs namespace reset and the
    /// status command; never used by the coordination protocol itself.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinatorError>;
}

/// Delete every key under `prefix`. Returns how many keys were removed.
pub async fn reset_namespace(kv: &dyn Kv, prefix: &str) -> Result<usize, CoordinatorError> {
    let keys = kv.scan_prefix(prefix).await?;
    for key in &keys {
        kv.delete(key).await?;
    }
    Ok(keys.len())
}

/// Wall-clock milliseconds since the unix epoch, the timestamp format used
/// for heartbeats and lock values.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
