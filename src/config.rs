//! Environment-style configuration plus fixed protocol constants.
//!
//! Deployment-dependent knobs come from the environment with defaults that
//! match a single-host development setup. Constants that belong to the
//! coordination protocol itself (lock lease times, liveness window, id scan
//! cap) live on [`Protocol`] and are not meant to vary per deployment.

use std::time::Duration;

/// Fixed protocol tuning. Changing these changes the wire behavior for every
/// process sharing the coordinator, so they are compile-time constants.
pub struct Protocol;

impl Protocol {
    /// Lease TTL on every lock key.
    pub const LOCK_TTL: Duration = Duration::from_secs(60);
    /// Age after which a lock value may be taken over.
    pub const LOCK_STALE_MS: u64 = 30_000;
    /// Interval between lock refreshes by the holder.
    pub const LOCK_REFRESH: Duration = Duration::from_secs(5);
    /// Max deviation between our last refresh stamp and the stored value
    /// before we conclude the lock was taken by someone else.
    pub const OWNERSHIP_DRIFT_MS: u64 = 20_000;

    /// A worker is live iff its heartbeat is younger than this.
    pub const LIVENESS_WINDOW_MS: u64 = 60_000;
    /// Interval between heartbeat writes.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

    /// Worker ids are scanned in `1..=MAX_WORKER_ID` for membership.
    pub const MAX_WORKER_ID: u32 = 20;
}

/// Strategy for opening the tabs of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabOpenStrategy {
    /// One tab at a time with a randomized pause between creations.
    Sequential,
    /// All tabs of the batch at once.
    Parallel,
}

/// Outbound proxy for browser contexts.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Deployment configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis endpoint backing the coordinator.
    pub coordinator_url: String,
    /// Prefix under which every coordinator key lives.
    pub namespace: String,
    /// SQLite endpoint for extracted records and audit events.
    pub database_url: String,

    /// Root of the target site, used for the signed-in probe.
    pub base_url: String,
    /// Listing URL template containing a `{page}` placeholder.
    pub listing_url_template: String,
    /// CSS selector whose presence on the base page means "signed in".
    pub signed_in_selector: String,

    pub proxy: Option<ProxyConfig>,

    /// Round-robin rotation mode instead of even distribution.
    pub rotation_enabled: bool,
    /// Pages handed out per rotation assignment.
    pub rotation_batch_size: u64,

    /// Pages opened as one tab batch by a general worker.
    pub tabs_per_batch: u64,
    pub tab_open_strategy: TabOpenStrategy,
    /// Uniform jitter bounds between sequential tab creations.
    pub tab_open_delay: (Duration, Duration),
    /// Directory where the HTTP-backed driver spools fetched tabs.
    pub tab_dir: String,
    /// Open a fresh browser context for every batch (coarse proxy rotation).
    pub context_per_batch: bool,
    /// Per-navigation timeout.
    pub navigation_timeout: Duration,

    pub manager_poll: Duration,
    pub general_poll: Duration,
    pub product_poll: Duration,
    /// Poll while waiting for a batch to drain.
    pub batch_poll: Duration,

    /// Fallback product-worker count when none has heartbeat yet.
    pub product_worker_total: u32,
    /// How long a general worker waits for an interactive login.
    pub login_wait: Duration,
    /// Backoff after the listing domain answers "service unavailable".
    pub unavailable_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            coordinator_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "crawlfleet".to_string(),
            database_url: "sqlite://./data/crawl-fleet.db".to_string(),
            base_url: "https://shop.example.com".to_string(),
            listing_url_template: "https://shop.example.com/listing?page={page}".to_string(),
            signed_in_selector: "[data-account-name]".to_string(),
            proxy: None,
            rotation_enabled: false,
            rotation_batch_size: 50,
            tabs_per_batch: 50,
            tab_open_strategy: TabOpenStrategy::Sequential,
            tab_open_delay: (Duration::from_millis(1000), Duration::from_millis(3000)),
            tab_dir: "./data/tabs".to_string(),
            context_per_batch: false,
            navigation_timeout: Duration::from_secs(45),
            manager_poll: Duration::from_secs(5),
            general_poll: Duration::from_secs(5),
            product_poll: Duration::from_secs(2),
            batch_poll: Duration::from_secs(2),
            product_worker_total: 4,
            login_wait: Duration::from_secs(300),
            unavailable_backoff: Duration::from_secs(300),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();

        let base_url = env_string("SITE_BASE_URL", &defaults.base_url);
        let listing_default = format!("{}/listing?page={{page}}", base_url.trim_end_matches('/'));
        let listing_url_template = env_string("LISTING_URL_TEMPLATE", &listing_default);

        let proxy = std::env::var("PROXY_SERVER").ok().map(|server| ProxyConfig {
            server,
            username: std::env::var("PROXY_USERNAME").ok(),
            password: std::env::var("PROXY_PASSWORD").ok(),
        });

        let strategy = match env_string("TAB_OPEN_STRATEGY", "sequential").as_str() {
            "parallel" => TabOpenStrategy::Parallel,
            _ => TabOpenStrategy::Sequential,
        };

        let delay_min = env_parse("TAB_OPEN_DELAY_MIN_MS", 1000u64);
        let delay_max = env_parse("TAB_OPEN_DELAY_MAX_MS", 3000u64).max(delay_min);

        Self {
            coordinator_url: env_string("REDIS_URL", &defaults.coordinator_url),
            namespace: env_string("COORDINATOR_NAMESPACE", &defaults.namespace),
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            base_url,
            listing_url_template,
            signed_in_selector: env_string("SIGNED_IN_SELECTOR", &defaults.signed_in_selector),
            proxy,
            rotation_enabled: env_bool("ENABLE_ROUND_ROBIN_ROTATION", false),
            rotation_batch_size: env_parse("ROTATION_BATCH_SIZE", defaults.rotation_batch_size),
            tabs_per_batch: env_parse("TABS_PER_BATCH", defaults.tabs_per_batch),
            tab_open_strategy: strategy,
            tab_open_delay: (
                Duration::from_millis(delay_min),
                Duration::from_millis(delay_max),
            ),
            tab_dir: env_string("TAB_SPOOL_DIR", &defaults.tab_dir),
            context_per_batch: env_bool("CONTEXT_PER_BATCH", false),
            navigation_timeout: env_secs("NAVIGATION_TIMEOUT_SECS", defaults.navigation_timeout),
            manager_poll: env_secs("MANAGER_POLL_SECS", defaults.manager_poll),
            general_poll: env_secs("GENERAL_POLL_SECS", defaults.general_poll),
            product_poll: env_secs("PRODUCT_POLL_SECS", defaults.product_poll),
            batch_poll: env_secs("BATCH_POLL_SECS", defaults.batch_poll),
            product_worker_total: env_parse("PRODUCT_WORKER_TOTAL", defaults.product_worker_total),
            login_wait: env_secs("LOGIN_WAIT_SECS", defaults.login_wait),
            unavailable_backoff: env_secs(
                "UNAVAILABLE_BACKOFF_SECS",
                defaults.unavailable_backoff,
            ),
        }
    }

    /// Render the listing URL for a page number.
    pub fn listing_url(&self, page: u64) -> String {
        self.listing_url_template
            .replace("{page}", &page.to_string())
    }

    /// Host of the listing domain, for the service-unavailable branch.
    pub fn listing_host(&self) -> Option<String> {
        url::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_url_substitutes_page() {
        let settings = Settings::default();
        assert_eq!(
            settings.listing_url(17),
            "https://shop.example.com/listing?page=17"
        );
    }

    #[test]
    fn listing_host_parses_base() {
        let settings = Settings::default();
        assert_eq!(settings.listing_host().as_deref(), Some("shop.example.com"));
    }

    #[test]
    fn defaults_match_protocol_numbers() {
        let settings = Settings::default();
        assert_eq!(settings.tabs_per_batch, 50);
        assert_eq!(settings.rotation_batch_size, 50);
        assert_eq!(settings.manager_poll, Duration::from_secs(5));
        assert_eq!(settings.product_poll, Duration::from_secs(2));
    }
}
