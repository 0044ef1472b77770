//! The coordinator keyspace and typed access to it.
//!
//! Coordinator values are plain strings; all parsing happens here at the
//! boundary. Reads return a [`Value`] so callers must handle a present,
//! missing, or unparseable key explicitly.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coordinator::{CoordinatorError, Kv};

/// Worker roles that participate in heartbeat membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    General,
    Product,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::General => "general",
            WorkerRole::Product => "product",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for every key the fleet uses, bound to a namespace prefix.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    /// The namespace prefix including its trailing separator, for scans.
    pub fn prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    fn key(&self, rest: &str) -> String {
        format!("{}:{}", self.prefix, rest)
    }

    pub fn total_pages(&self) -> String {
        self.key("totalPages")
    }

    pub fn total_products(&self) -> String {
        self.key("totalProducts")
    }

    pub fn heartbeat(&self, role: WorkerRole, id: u32) -> String {
        self.key(&format!("{}:{}:heartbeat", role, id))
    }

    pub fn pages(&self, role: WorkerRole, id: u32) -> String {
        self.key(&format!("{}:{}:pages", role, id))
    }

    pub fn complete(&self, role: WorkerRole, id: u32) -> String {
        self.key(&format!("{}:{}:complete", role, id))
    }

    /// Set while a general worker is mid-batch; only general workers have it.
    pub fn processing(&self, id: u32) -> String {
        self.key(&format!("general:{}:processing", id))
    }

    pub fn tabs_ready(&self) -> String {
        self.key("tabsReady")
    }

    pub fn crawl_trigger(&self) -> String {
        self.key("crawlTrigger")
    }

    pub fn batch_start(&self) -> String {
        self.key("batch:start")
    }

    pub fn batch_end(&self) -> String {
        self.key("batch:end")
    }

    pub fn batch_complete(&self) -> String {
        self.key("batchComplete")
    }

    pub fn rotation_index(&self) -> String {
        self.key("rotation:index")
    }

    pub fn rotation_last_assigned(&self) -> String {
        self.key("rotation:lastAssignedPage")
    }

    pub fn session_cookies(&self) -> String {
        self.key("session:cookies")
    }

    pub fn session_valid(&self) -> String {
        self.key("session:valid")
    }

    pub fn lock(&self, role: &str, id: u32) -> String {
        self.key(&format!("lock:{}-{}", role, id))
    }

    pub fn manager_lock(&self) -> String {
        self.lock("manager", 1)
    }

    pub fn worker_lock(&self, role: WorkerRole, id: u32) -> String {
        self.lock(role.as_str(), id)
    }
}

/// Result of reading a typed coordinator value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<T> {
    Present(T),
    Absent,
    /// The key exists but its raw string did not parse.
    Invalid(String),
}

impl<T> Value<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Value::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }
}

impl<T: Copy> Value<T> {
    /// Collapse to a default, warning on an unparseable value. This is the
    /// treat-invalid-as-zero policy for numeric keys.
    pub fn unwrap_or_warn(&self, key: &str, default: T) -> T {
        match self {
            Value::Present(v) => *v,
            Value::Absent => default,
            Value::Invalid(raw) => {
                tracing::warn!(key, %raw, "invalid coordinator value, using default");
                default
            }
        }
    }
}

pub async fn read_u64(kv: &dyn Kv, key: &str) -> Result<Value<u64>, CoordinatorError> {
    Ok(match kv.get(key).await? {
        None => Value::Absent,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => Value::Present(n),
            Err(_) => Value::Invalid(raw),
        },
    })
}

pub async fn read_json<T: DeserializeOwned>(
    kv: &dyn Kv,
    key: &str,
) -> Result<Value<T>, CoordinatorError> {
    Ok(match kv.get(key).await? {
        None => Value::Absent,
        Some(raw) => match serde_json::from_str::<T>(&raw) {
            Ok(v) => Value::Present(v),
            Err(_) => Value::Invalid(raw),
        },
    })
}

/// Flags are written as the literal string "1".
pub async fn read_flag(kv: &dyn Kv, key: &str) -> Result<bool, CoordinatorError> {
    Ok(matches!(kv.get(key).await?.as_deref(), Some("1")))
}

pub async fn write_u64(kv: &dyn Kv, key: &str, value: u64) -> Result<(), CoordinatorError> {
    kv.set(key, &value.to_string()).await
}

pub async fn write_json<T: Serialize>(
    kv: &dyn Kv,
    key: &str,
    value: &T,
) -> Result<(), CoordinatorError> {
    let raw = serde_json::to_string(value).unwrap_or_default();
    kv.set(key, &raw).await
}

pub async fn set_flag(kv: &dyn Kv, key: &str) -> Result<(), CoordinatorError> {
    kv.set(key, "1").await
}

pub async fn clear(kv: &dyn Kv, key: &str) -> Result<(), CoordinatorError> {
    kv.delete(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryKv;
    use crate::models::PageRange;

    #[test]
    fn key_layout() {
        let ks = Keyspace::new("crawlfleet");
        assert_eq!(ks.total_pages(), "crawlfleet:totalPages");
        assert_eq!(
            ks.heartbeat(WorkerRole::General, 3),
            "crawlfleet:general:3:heartbeat"
        );
        assert_eq!(
            ks.pages(WorkerRole::Product, 2),
            "crawlfleet:product:2:pages"
        );
        assert_eq!(ks.manager_lock(), "crawlfleet:lock:manager-1");
        assert_eq!(
            ks.worker_lock(WorkerRole::General, 7),
            "crawlfleet:lock:general-7"
        );
        assert_eq!(ks.prefix(), "crawlfleet:");
    }

    #[tokio::test]
    async fn read_u64_distinguishes_all_cases() {
        let kv = MemoryKv::new();
        assert_eq!(read_u64(&kv, "n").await.unwrap(), Value::Absent);

        kv.set("n", "300").await.unwrap();
        assert_eq!(read_u64(&kv, "n").await.unwrap(), Value::Present(300));

        kv.set("n", "garbage").await.unwrap();
        assert_eq!(
            read_u64(&kv, "n").await.unwrap(),
            Value::Invalid("garbage".to_string())
        );
        assert_eq!(read_u64(&kv, "n").await.unwrap().unwrap_or_warn("n", 0), 0);
    }

    #[tokio::test]
    async fn json_round_trip_for_page_range() {
        let kv = MemoryKv::new();
        write_json(&kv, "r", &PageRange::new(1, 150)).await.unwrap();
        let got: Value<PageRange> = read_json(&kv, "r").await.unwrap();
        assert_eq!(got, Value::Present(PageRange::new(1, 150)));
    }

    #[tokio::test]
    async fn flags_only_match_literal_one() {
        let kv = MemoryKv::new();
        assert!(!read_flag(&kv, "f").await.unwrap());
        set_flag(&kv, "f").await.unwrap();
        assert!(read_flag(&kv, "f").await.unwrap());
        kv.set("f", "true").await.unwrap();
        assert!(!read_flag(&kv, "f").await.unwrap());
    }
}
