use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{CoordinatorError, Kv};
use async_trait::async_trait;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process coordinator with the same TTL semantics as Redis.
///
/// Exists so the whole coordination protocol can be exercised hermetically;
/// also usable for single-process runs. `advance` skews the expiry clock so
/// tests cover lease expiry without sleeping.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    skew: Mutex<Duration>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the expiry clock forward. Test support only.
    pub fn advance(&self, by: Duration) {
        *self.skew.lock() += by;
    }

    fn now(&self) -> Instant {
        Instant::now() + *self.skew.lock()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = self.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= now) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinatorError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CoordinatorError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinatorError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        let expires_at = Some(self.now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, CoordinatorError> {
        let old = self.live_value(key);
        // A plain SET discards any TTL, matching Redis GETSET.
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(old)
    }

    async fn refresh(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CoordinatorError> {
        let expires_at = Some(self.now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinatorError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinatorError> {
        let now = self.now();
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| {
                k.starts_with(prefix) && !e.expires_at.is_some_and(|at| at <= now)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::reset_namespace;

    #[tokio::test]
    async fn acquire_respects_existing_key() {
        let kv = MemoryKv::new();
        assert!(kv.acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.acquire("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn acquire_succeeds_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.acquire("k", "a", Duration::from_secs(60)).await.unwrap());
        kv.advance(Duration::from_secs(61));
        assert!(kv.acquire("k", "b", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn swap_clears_ttl() {
        let kv = MemoryKv::new();
        kv.acquire("k", "a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.swap("k", "b").await.unwrap(), Some("a".to_string()));
        kv.advance(Duration::from_secs(120));
        // Still present because the swap dropped the lease.
        assert_eq!(kv.get("k").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn reset_removes_only_namespace() {
        let kv = MemoryKv::new();
        kv.set("fleet:a", "1").await.unwrap();
        kv.set("fleet:b", "2").await.unwrap();
        kv.set("other:c", "3").await.unwrap();
        let removed = reset_namespace(&kv, "fleet:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.get("other:c").await.unwrap(), Some("3".to_string()));
    }
}
