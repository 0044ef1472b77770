//! Browser driver boundary.
//!
//! The control plane never talks to a browser directly; it goes through
//! [`BrowserDriver`]. Contexts carry cookies and an optional proxy, tabs are
//! opened fire-and-forget and located later by their `page=<n>` URL, and
//! extraction yields [`ListingRecord`]s. Tab ownership is by convention:
//! the general worker that opened a window of tabs is the only one that
//! closes it; product workers locate and read tabs but never close them.
//!
//! The in-tree production implementation is [`HttpBrowser`], which renders
//! a "context" as a cookie-carrying HTTP client and a "tab" as a spooled
//! fetch shared between processes on the same host. A remote-debug browser
//! can be slotted in behind the same trait.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ProxyConfig;
use crate::models::{Cookie, ListingRecord, PageRange};

pub use http::{HttpBrowser, HttpBrowserConfig};
pub use memory::MemoryBrowser;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    /// The listing domain answered with its throttle page; callers back
    /// off for several minutes before retrying.
    #[error("listing domain unavailable at {url}")]
    ServiceUnavailable { url: String },
    #[error("unknown browser context {0}")]
    UnknownContext(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("tab spool error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle to a browser context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub String);

/// A tab as visible to other workers: its URL and, when the URL carries a
/// `page=<n>` query parameter on the listing domain, that page number.
#[derive(Debug, Clone)]
pub struct TabInfo {
    pub url: String,
    pub page: Option<u64>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a context with an optional proxy and an initial cookie jar.
    async fn open_context(
        &self,
        proxy: Option<&ProxyConfig>,
        cookies: &[Cookie],
    ) -> Result<ContextId, BrowserError>;

    async fn close_context(&self, ctx: &ContextId) -> Result<(), BrowserError>;

    /// Create a tab and start navigating it. Navigation completion is not
    /// awaited; the tab exists immediately and loads in the background.
    async fn open_tab(&self, ctx: &ContextId, url: &str) -> Result<(), BrowserError>;

    /// All tabs across all contexts on this host.
    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserError>;

    /// Locate the tab showing listing page `page`, if any context has one.
    async fn find_listing_tab(&self, page: u64) -> Result<Option<TabInfo>, BrowserError>;

    /// Close every tab whose page lies in `window`. Idempotent over tabs
    /// already closed; returns how many were actually closed.
    async fn close_tabs_in_window(&self, window: PageRange) -> Result<usize, BrowserError>;

    /// Extract listing records from a located tab.
    async fn extract_listing(&self, tab: &TabInfo) -> Result<Vec<ListingRecord>, BrowserError>;

    /// Read `(totalPages, totalProducts)` off the listing's first page.
    async fn discover_totals(&self, ctx: &ContextId) -> Result<(u64, u64), BrowserError>;

    /// Whether the site shows its signed-in indicator for this context.
    async fn is_signed_in(&self, ctx: &ContextId) -> Result<bool, BrowserError>;

    /// Current cookie jar of a context.
    async fn cookies(&self, ctx: &ContextId) -> Result<Vec<Cookie>, BrowserError>;

    /// Install cookies into a context before its next navigation.
    async fn set_cookies(&self, ctx: &ContextId, cookies: &[Cookie])
        -> Result<(), BrowserError>;
}

/// Extract the `page` query parameter from a listing URL.
pub fn page_from_url(url: &str) -> Option<u64> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "page")
        .and_then(|(_, v)| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_param_parsing() {
        assert_eq!(
            page_from_url("https://shop.example.com/listing?page=17"),
            Some(17)
        );
        assert_eq!(
            page_from_url("https://shop.example.com/listing?sort=asc&page=3"),
            Some(3)
        );
        assert_eq!(page_from_url("https://shop.example.com/listing"), None);
        assert_eq!(page_from_url("not a url"), None);
    }
}
