pub mod backoff;
pub mod batch;
pub mod browser;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod extract;
pub mod general;
pub mod heartbeat;
pub mod keys;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod models;
pub mod partition;
pub mod product;
pub mod rebalance;
pub mod session;
pub mod shutdown;
pub mod storage;

// Re-export main types for library usage
pub use browser::{BrowserDriver, HttpBrowser, HttpBrowserConfig, MemoryBrowser};
pub use config::{Protocol, Settings};
pub use coordinator::{Kv, MemoryKv, RedisKv};
pub use general::GeneralWorker;
pub use keys::{Keyspace, Value, WorkerRole};
pub use lock::LeaseLock;
pub use manager::Manager;
pub use models::{CrawlEvent, ListingRecord, PageRange};
pub use product::ProductWorker;
pub use session::SessionBroker;
pub use storage::{ListingStore, SqliteStore};
