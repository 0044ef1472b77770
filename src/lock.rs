//! Lease lock over the coordinator.
//!
//! The store has no compare-and-swap on values, so first acquisition uses
//! conditional-set-with-TTL and takeover/refresh use atomic get-and-set plus
//! an ownership-drift heuristic: lock values are write timestamps, and a
//! stored stamp that moved more than `OWNERSHIP_DRIFT_MS` away from our own
//! last write means another process took the key between refreshes.
//!
//! The same lock guards the manager singleton (`lock:manager-1`) and each
//! worker instance (`lock:<role>-<id>`).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Protocol;
use crate::coordinator::{now_millis, CoordinatorError, Kv};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another instance already holds {key}")]
    Contended { key: String },
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub struct LeaseLock {
    kv: Arc<dyn Kv>,
    key: String,
    ttl: Duration,
    stale_ms: u64,
    drift_ms: u64,
    /// Timestamp we last wrote to the key; `None` while not holding.
    last_refresh: Mutex<Option<u64>>,
}

impl LeaseLock {
    pub fn new(kv: Arc<dyn Kv>, key: String) -> Self {
        Self {
            kv,
            key,
            ttl: Protocol::LOCK_TTL,
            stale_ms: Protocol::LOCK_STALE_MS,
            drift_ms: Protocol::OWNERSHIP_DRIFT_MS,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.last_refresh.lock().is_some()
    }

    /// Try to take the lock. Fails fast on a fresh foreign holder; a stale
    /// holder is taken over via swap. At most one post-swap retry.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let stamp = now_millis();
        if self.kv.acquire(&self.key, &stamp.to_string(), self.ttl).await? {
            *self.last_refresh.lock() = Some(stamp);
            debug!(key = %self.key, "lock acquired");
            return Ok(());
        }

        for attempt in 0..2 {
            let Some(current) = self.kv.get(&self.key).await? else {
                // Expired between our conditional set and this read.
                let stamp = now_millis();
                if self
                    .kv
                    .acquire(&self.key, &stamp.to_string(), self.ttl)
                    .await?
                {
                    *self.last_refresh.lock() = Some(stamp);
                    debug!(key = %self.key, "lock acquired after expiry");
                    return Ok(());
                }
                continue;
            };

            // An unparseable value cannot be fresh; treat it as stale.
            let held_at = current.trim().parse::<u64>().unwrap_or(0);
            let now = now_millis();
            if now.saturating_sub(held_at) < self.stale_ms {
                return Err(LockError::Contended {
                    key: self.key.clone(),
                });
            }

            let stamp = now_millis();
            match self.kv.swap(&self.key, &stamp.to_string()).await? {
                Some(old) if old == current => {
                    // We replaced the stale value; the swap dropped the TTL,
                    // so reinstate the lease.
                    self.kv
                        .refresh(&self.key, &stamp.to_string(), self.ttl)
                        .await?;
                    *self.last_refresh.lock() = Some(stamp);
                    debug!(key = %self.key, attempt, "stale lock taken over");
                    return Ok(());
                }
                None => {
                    // The key vanished mid-race and the swap installed our
                    // stamp, which makes us the holder.
                    self.kv
                        .refresh(&self.key, &stamp.to_string(), self.ttl)
                        .await?;
                    *self.last_refresh.lock() = Some(stamp);
                    debug!(key = %self.key, attempt, "lock acquired during race");
                    return Ok(());
                }
                Some(other) => {
                    let other_at = other.trim().parse::<u64>().unwrap_or(0);
                    if now_millis().saturating_sub(other_at) < self.stale_ms {
                        // A fresh competitor wrote between our read and swap;
                        // put their value back and give up.
                        self.kv.set(&self.key, &other).await?;
                        return Err(LockError::Contended {
                            key: self.key.clone(),
                        });
                    }
                    // Another stale value: loop for the single retry.
                }
            }
        }

        Err(LockError::Contended {
            key: self.key.clone(),
        })
    }

    /// Refresh the lease. Returns `false` when ownership was lost, after
    /// which the caller must stop acting as holder.
    pub async fn refresh(&self) -> Result<bool, LockError> {
        let Some(last) = *self.last_refresh.lock() else {
            return Ok(false);
        };

        let Some(current) = self.kv.get(&self.key).await? else {
            warn!(key = %self.key, "lock key gone, ownership lost");
            *self.last_refresh.lock() = None;
            return Ok(false);
        };

        match current.trim().parse::<u64>() {
            Ok(stored) => {
                if stored.abs_diff(last) > self.drift_ms {
                    warn!(
                        key = %self.key,
                        stored,
                        last,
                        "lock value drifted, held by another process"
                    );
                    *self.last_refresh.lock() = None;
                    return Ok(false);
                }
            }
            Err(_) => {
                warn!(key = %self.key, raw = %current, "lock value unparseable, treating as lost");
                *self.last_refresh.lock() = None;
                return Ok(false);
            }
        }

        let stamp = now_millis();
        match self.kv.swap(&self.key, &stamp.to_string()).await? {
            Some(old) if old == current => {
                self.kv
                    .refresh(&self.key, &stamp.to_string(), self.ttl)
                    .await?;
                *self.last_refresh.lock() = Some(stamp);
                Ok(true)
            }
            old => {
                // Someone slipped in between read and swap; undo our write.
                if let Some(theirs) = old {
                    self.kv.set(&self.key, &theirs).await?;
                }
                warn!(key = %self.key, "lost lock during refresh");
                *self.last_refresh.lock() = None;
                Ok(false)
            }
        }
    }

    /// Graceful release. Only deletes; crash cleanup is the TTL's job.
    pub async fn release(&self) -> Result<(), CoordinatorError> {
        *self.last_refresh.lock() = None;
        self.kv.delete(&self.key).await
    }
}
