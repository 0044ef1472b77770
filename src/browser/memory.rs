//! Scripted in-process browser for hermetic tests.
//!
//! Pages are scripted with the records they should yield; tabs and cookie
//! jars behave like the real driver, including the page-ownership rules.
//! Sign-in is modeled as "the jar holds the accepted session cookie", which
//! is enough to exercise the cookie fan-out protocol end to end.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{page_from_url, BrowserDriver, BrowserError, ContextId, TabInfo};
use crate::config::ProxyConfig;
use crate::models::{Cookie, ListingRecord, PageRange};
use async_trait::async_trait;

pub const SESSION_COOKIE: &str = "session";

#[derive(Default)]
pub struct MemoryBrowser {
    scripted_pages: DashMap<u64, Vec<ListingRecord>>,
    tabs: DashMap<u64, TabInfo>,
    contexts: DashMap<String, Mutex<Vec<Cookie>>>,
    totals: Mutex<(u64, u64)>,
    /// Session-cookie value the "site" accepts; empty means logged out.
    accepted_session: Mutex<String>,
    /// Pages that answer with the throttle page.
    unavailable_pages: DashMap<u64, ()>,
    next_context: AtomicU64,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the records a listing page yields on extraction.
    pub fn script_page(&self, page: u64, records: Vec<ListingRecord>) {
        self.scripted_pages.insert(page, records);
    }

    pub fn set_totals(&self, total_pages: u64, total_products: u64) {
        *self.totals.lock() = (total_pages, total_products);
    }

    /// Declare the session-cookie value the site will accept.
    pub fn set_accepted_session(&self, value: &str) {
        *self.accepted_session.lock() = value.to_string();
    }

    /// Simulate a human logging in inside this context's visible browser:
    /// the accepted session cookie appears in the context jar.
    pub fn complete_interactive_login(&self, ctx: &ContextId) {
        let value = self.accepted_session.lock().clone();
        if let Some(jar) = self.contexts.get(&ctx.0) {
            let mut jar = jar.lock();
            jar.retain(|c| c.name != SESSION_COOKIE);
            jar.push(Cookie {
                name: SESSION_COOKIE.to_string(),
                value,
                domain: "shop.example.com".to_string(),
                path: "/".to_string(),
                secure: true,
                http_only: true,
                expires: None,
            });
        }
    }

    pub fn mark_unavailable(&self, page: u64) {
        self.unavailable_pages.insert(page, ());
    }

    pub fn clear_unavailable(&self, page: u64) {
        self.unavailable_pages.remove(&page);
    }

    pub fn open_tab_count(&self) -> usize {
        self.tabs.len()
    }
}

#[async_trait]
impl BrowserDriver for MemoryBrowser {
    async fn open_context(
        &self,
        _proxy: Option<&ProxyConfig>,
        cookies: &[Cookie],
    ) -> Result<ContextId, BrowserError> {
        let id = format!("mem-{}", self.next_context.fetch_add(1, Ordering::Relaxed));
        self.contexts.insert(id.clone(), Mutex::new(cookies.to_vec()));
        Ok(ContextId(id))
    }

    async fn close_context(&self, ctx: &ContextId) -> Result<(), BrowserError> {
        self.contexts.remove(&ctx.0);
        Ok(())
    }

    async fn open_tab(&self, ctx: &ContextId, url: &str) -> Result<(), BrowserError> {
        if !self.contexts.contains_key(&ctx.0) {
            return Err(BrowserError::UnknownContext(ctx.0.clone()));
        }
        let page = page_from_url(url);
        if let Some(p) = page {
            if self.unavailable_pages.contains_key(&p) {
                return Err(BrowserError::ServiceUnavailable {
                    url: url.to_string(),
                });
            }
            self.tabs.insert(
                p,
                TabInfo {
                    url: url.to_string(),
                    page,
                },
            );
        }
        Ok(())
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserError> {
        Ok(self.tabs.iter().map(|t| t.value().clone()).collect())
    }

    async fn find_listing_tab(&self, page: u64) -> Result<Option<TabInfo>, BrowserError> {
        Ok(self.tabs.get(&page).map(|t| t.value().clone()))
    }

    async fn close_tabs_in_window(&self, window: PageRange) -> Result<usize, BrowserError> {
        let mut closed = 0;
        for page in window.pages() {
            if self.tabs.remove(&page).is_some() {
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn extract_listing(&self, tab: &TabInfo) -> Result<Vec<ListingRecord>, BrowserError> {
        let page = tab
            .page
            .ok_or_else(|| BrowserError::Extraction("tab has no page".to_string()))?;
        if !self.tabs.contains_key(&page) {
            return Err(BrowserError::Extraction(format!(
                "tab for page {} was closed",
                page
            )));
        }
        Ok(self
            .scripted_pages
            .get(&page)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn discover_totals(&self, _ctx: &ContextId) -> Result<(u64, u64), BrowserError> {
        Ok(*self.totals.lock())
    }

    async fn is_signed_in(&self, ctx: &ContextId) -> Result<bool, BrowserError> {
        let accepted = self.accepted_session.lock().clone();
        if accepted.is_empty() {
            return Ok(false);
        }
        let jar = self
            .contexts
            .get(&ctx.0)
            .ok_or_else(|| BrowserError::UnknownContext(ctx.0.clone()))?;
        let signed_in = jar
            .lock()
            .iter()
            .any(|c| c.name == SESSION_COOKIE && c.value == accepted);
        Ok(signed_in)
    }

    async fn cookies(&self, ctx: &ContextId) -> Result<Vec<Cookie>, BrowserError> {
        let jar = self
            .contexts
            .get(&ctx.0)
            .ok_or_else(|| BrowserError::UnknownContext(ctx.0.clone()))?;
        let cookies = jar.lock().clone();
        Ok(cookies)
    }

    async fn set_cookies(
        &self,
        ctx: &ContextId,
        cookies: &[Cookie],
    ) -> Result<(), BrowserError> {
        let jar = self
            .contexts
            .get(&ctx.0)
            .ok_or_else(|| BrowserError::UnknownContext(ctx.0.clone()))?;
        let mut jar = jar.lock();
        for cookie in cookies {
            match jar
                .iter_mut()
                .find(|c| c.name == cookie.name && c.domain == cookie.domain)
            {
                Some(existing) => *existing = cookie.clone(),
                None => jar.push(cookie.clone()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, page: u64) -> ListingRecord {
        ListingRecord {
            listing_id: id.to_string(),
            url: format!("https://shop.example.com/item/{}", id),
            title: "x".to_string(),
            page,
            price_minor: None,
            currency: None,
            rating: None,
            rating_count: None,
            image_urls: vec![],
        }
    }

    #[tokio::test]
    async fn tabs_open_close_and_extract() {
        let browser = MemoryBrowser::new();
        browser.script_page(2, vec![record("A123456789", 2)]);

        let ctx = browser.open_context(None, &[]).await.unwrap();
        browser
            .open_tab(&ctx, "https://shop.example.com/listing?page=2")
            .await
            .unwrap();

        let tab = browser.find_listing_tab(2).await.unwrap().unwrap();
        let records = browser.extract_listing(&tab).await.unwrap();
        assert_eq!(records.len(), 1);

        assert_eq!(
            browser
                .close_tabs_in_window(PageRange::new(1, 5))
                .await
                .unwrap(),
            1
        );
        assert!(browser.find_listing_tab(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_page_errors_on_open() {
        let browser = MemoryBrowser::new();
        browser.mark_unavailable(4);
        let ctx = browser.open_context(None, &[]).await.unwrap();
        let err = browser
            .open_tab(&ctx, "https://shop.example.com/listing?page=4")
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn sign_in_follows_session_cookie() {
        let browser = MemoryBrowser::new();
        browser.set_accepted_session("tok-1");
        let ctx = browser.open_context(None, &[]).await.unwrap();
        assert!(!browser.is_signed_in(&ctx).await.unwrap());

        browser.complete_interactive_login(&ctx);
        assert!(browser.is_signed_in(&ctx).await.unwrap());

        // A second context reusing the published jar is signed in too.
        let jar = browser.cookies(&ctx).await.unwrap();
        let ctx2 = browser.open_context(None, &jar).await.unwrap();
        assert!(browser.is_signed_in(&ctx2).await.unwrap());
    }
}
