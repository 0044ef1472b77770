//! HTTP-backed browser driver.
//!
//! Renders the driver contract without a real browser: a context is a
//! `reqwest` client plus an explicit cookie jar, and a tab is a fetch whose
//! HTML is spooled to a directory shared by every worker process on the
//! host. The general worker writes and closes spool entries; product
//! workers only read them, which preserves the tab-ownership convention.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{page_from_url, BrowserDriver, BrowserError, ContextId, TabInfo};
use crate::config::{ProxyConfig, Settings};
use crate::coordinator::now_millis;
use crate::extract::{self, ListingSelectors};
use crate::models::{Cookie, ListingRecord, PageRange};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct HttpBrowserConfig {
    pub tab_dir: PathBuf,
    pub base_url: String,
    pub listing_host: Option<String>,
    pub listing_url_template: String,
    pub signed_in_selector: String,
    pub selectors: ListingSelectors,
    pub navigation_timeout: Duration,
    pub user_agent: String,
}

impl HttpBrowserConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tab_dir: PathBuf::from(&settings.tab_dir),
            base_url: settings.base_url.clone(),
            listing_host: settings.listing_host(),
            listing_url_template: settings.listing_url_template.clone(),
            signed_in_selector: settings.signed_in_selector.clone(),
            selectors: ListingSelectors::default(),
            navigation_timeout: settings.navigation_timeout,
            user_agent: "crawl-fleet/0.3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TabStatus {
    Loading,
    Loaded,
    Failed,
}

/// On-disk form of one tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpooledTab {
    url: String,
    page: Option<u64>,
    status: TabStatus,
    html: String,
    opened_at: u64,
}

struct HttpContext {
    client: reqwest::Client,
    cookies: parking_lot::Mutex<Vec<Cookie>>,
}

pub struct HttpBrowser {
    config: HttpBrowserConfig,
    contexts: DashMap<String, Arc<HttpContext>>,
    next_context: AtomicU64,
}

impl HttpBrowser {
    pub fn new(config: HttpBrowserConfig) -> Result<Self, BrowserError> {
        std::fs::create_dir_all(&config.tab_dir)?;
        Ok(Self {
            config,
            contexts: DashMap::new(),
            next_context: AtomicU64::new(1),
        })
    }

    fn context(&self, ctx: &ContextId) -> Result<Arc<HttpContext>, BrowserError> {
        self.contexts
            .get(&ctx.0)
            .map(|c| c.value().clone())
            .ok_or_else(|| BrowserError::UnknownContext(ctx.0.clone()))
    }

    fn spool_path(&self, url: &str, page: Option<u64>) -> PathBuf {
        match page {
            Some(n) => self.config.tab_dir.join(format!("page-{}.json", n)),
            None => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                url.hash(&mut hasher);
                self.config
                    .tab_dir
                    .join(format!("url-{:016x}.json", hasher.finish()))
            }
        }
    }

    fn is_listing_url(&self, url: &str) -> bool {
        match (&self.config.listing_host, url::Url::parse(url)) {
            (Some(host), Ok(parsed)) => parsed.host_str() == Some(host.as_str()),
            _ => false,
        }
    }

    async fn write_spool(path: &Path, tab: &SpooledTab) -> Result<(), BrowserError> {
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(tab)
            .map_err(|e| BrowserError::Extraction(format!("spool encode: {}", e)))?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_spool(path: &Path) -> Result<Option<SpooledTab>, BrowserError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// GET with the context's cookie jar, folding Set-Cookie answers back in.
    async fn fetch(
        &self,
        ctx: &Arc<HttpContext>,
        url: &str,
    ) -> Result<reqwest::Response, BrowserError> {
        let header = cookie_header(&ctx.cookies.lock());
        let mut request = ctx.client.get(url);
        if !header.is_empty() {
            request = request.header(reqwest::header::COOKIE, header);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE
            && self.is_listing_url(url)
        {
            return Err(BrowserError::ServiceUnavailable {
                url: url.to_string(),
            });
        }

        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let new_cookies: Vec<Cookie> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| parse_set_cookie(raw, &host))
            .collect();
        if !new_cookies.is_empty() {
            let mut jar = ctx.cookies.lock();
            for cookie in new_cookies {
                upsert_cookie(&mut jar, cookie);
            }
        }

        Ok(response)
    }

    async fn fetch_html(
        &self,
        ctx: &Arc<HttpContext>,
        url: &str,
    ) -> Result<String, BrowserError> {
        let response = self.fetch(ctx, url).await?;
        response
            .text()
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn upsert_cookie(jar: &mut Vec<Cookie>, cookie: Cookie) {
    match jar
        .iter_mut()
        .find(|c| c.name == cookie.name && c.domain == cookie.domain)
    {
        Some(existing) => *existing = cookie,
        None => jar.push(cookie),
    }
}

/// Minimal Set-Cookie parser: name, value and the attributes we share
/// through the coordinator. Expiry text is not interpreted.
fn parse_set_cookie(raw: &str, request_host: &str) -> Option<Cookie> {
    let mut segments = raw.split(';').map(str::trim);
    let (name, value) = segments.next()?.split_once('=')?;
    if name.is_empty() {
        return None;
    }

    let mut cookie = Cookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain: request_host.to_string(),
        path: "/".to_string(),
        secure: false,
        http_only: false,
        expires: None,
    };

    for segment in segments {
        match segment.split_once('=') {
            Some((k, v)) => match k.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = v.trim_start_matches('.').to_string(),
                "path" => cookie.path = v.to_string(),
                _ => {}
            },
            None => match segment.to_ascii_lowercase().as_str() {
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            },
        }
    }

    Some(cookie)
}

#[async_trait]
impl BrowserDriver for HttpBrowser {
    async fn open_context(
        &self,
        proxy: Option<&ProxyConfig>,
        cookies: &[Cookie],
    ) -> Result<ContextId, BrowserError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(self.config.navigation_timeout)
            .gzip(true);

        if let Some(proxy) = proxy {
            let mut p = reqwest::Proxy::all(&proxy.server).map_err(|e| {
                BrowserError::Navigation {
                    url: proxy.server.clone(),
                    reason: e.to_string(),
                }
            })?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p);
        }

        let client = builder.build().map_err(|e| BrowserError::Navigation {
            url: self.config.base_url.clone(),
            reason: e.to_string(),
        })?;

        let id = format!("ctx-{}", self.next_context.fetch_add(1, Ordering::Relaxed));
        self.contexts.insert(
            id.clone(),
            Arc::new(HttpContext {
                client,
                cookies: parking_lot::Mutex::new(cookies.to_vec()),
            }),
        );
        debug!(context = %id, cookies = cookies.len(), "browser context opened");
        Ok(ContextId(id))
    }

    async fn close_context(&self, ctx: &ContextId) -> Result<(), BrowserError> {
        self.contexts.remove(&ctx.0);
        Ok(())
    }

    async fn open_tab(&self, ctx: &ContextId, url: &str) -> Result<(), BrowserError> {
        let context = self.context(ctx)?;
        let page = page_from_url(url);
        let path = self.spool_path(url, page);

        // The tab exists as soon as navigation starts.
        Self::write_spool(
            &path,
            &SpooledTab {
                url: url.to_string(),
                page,
                status: TabStatus::Loading,
                html: String::new(),
                opened_at: now_millis(),
            },
        )
        .await?;

        let response = match self.fetch(&context, url).await {
            Ok(r) => r,
            Err(e) => {
                // ServiceUnavailable propagates for the caller's long
                // backoff; the placeholder must not linger either way.
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "tab navigation returned non-success");
        }

        // Body download completes in the background, like a tab that keeps
        // rendering after creation.
        let url_owned = url.to_string();
        tokio::spawn(async move {
            let (status, html) = match response.text().await {
                Ok(body) => (TabStatus::Loaded, body),
                Err(e) => {
                    warn!(url = %url_owned, error = %e, "tab body read failed");
                    (TabStatus::Failed, String::new())
                }
            };
            let tab = SpooledTab {
                url: url_owned,
                page,
                status,
                html,
                opened_at: now_millis(),
            };
            if let Err(e) = Self::write_spool(&path, &tab).await {
                warn!(error = %e, "tab spool write failed");
            }
        });

        Ok(())
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BrowserError> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.tab_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(tab) = Self::read_spool(&entry.path()).await? {
                out.push(TabInfo {
                    url: tab.url,
                    page: tab.page,
                });
            }
        }
        Ok(out)
    }

    async fn find_listing_tab(&self, page: u64) -> Result<Option<TabInfo>, BrowserError> {
        let path = self.config.tab_dir.join(format!("page-{}.json", page));
        Ok(Self::read_spool(&path).await?.and_then(|tab| {
            if tab.status == TabStatus::Failed {
                None
            } else {
                Some(TabInfo {
                    url: tab.url,
                    page: tab.page,
                })
            }
        }))
    }

    async fn close_tabs_in_window(&self, window: PageRange) -> Result<usize, BrowserError> {
        let mut closed = 0usize;
        for page in window.pages() {
            let path = self.config.tab_dir.join(format!("page-{}.json", page));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => closed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(closed)
    }

    async fn extract_listing(&self, tab: &TabInfo) -> Result<Vec<ListingRecord>, BrowserError> {
        let page = tab
            .page
            .ok_or_else(|| BrowserError::Extraction(format!("tab {} has no page", tab.url)))?;
        let path = self.config.tab_dir.join(format!("page-{}.json", page));

        // A freshly opened tab may still be loading; wait out the
        // navigation timeout before giving up on it.
        let deadline = tokio::time::Instant::now() + self.config.navigation_timeout;
        loop {
            match Self::read_spool(&path).await? {
                Some(spooled) if spooled.status == TabStatus::Loaded => {
                    return extract::extract_listing(&spooled.html, page, &self.config.selectors)
                        .map_err(|e| BrowserError::Extraction(e.to_string()));
                }
                Some(spooled) if spooled.status == TabStatus::Failed => {
                    return Err(BrowserError::Extraction(format!(
                        "tab for page {} failed to load",
                        page
                    )));
                }
                Some(_) if tokio::time::Instant::now() < deadline => {
                    sleep(Duration::from_millis(250)).await;
                }
                Some(_) => {
                    return Err(BrowserError::Extraction(format!(
                        "tab for page {} still loading after timeout",
                        page
                    )));
                }
                None => {
                    return Err(BrowserError::Extraction(format!(
                        "tab for page {} was closed",
                        page
                    )));
                }
            }
        }
    }

    async fn discover_totals(&self, ctx: &ContextId) -> Result<(u64, u64), BrowserError> {
        let context = self.context(ctx)?;
        let url = self.config.listing_url_template.replace("{page}", "1");
        let html = self.fetch_html(&context, &url).await?;
        extract::extract_totals(&html, &self.config.selectors)
            .map_err(|e| BrowserError::Extraction(e.to_string()))
    }

    async fn is_signed_in(&self, ctx: &ContextId) -> Result<bool, BrowserError> {
        let context = self.context(ctx)?;
        let html = self.fetch_html(&context, &self.config.base_url).await?;
        extract::has_match(&html, &self.config.signed_in_selector)
            .map_err(|e| BrowserError::Extraction(e.to_string()))
    }

    async fn cookies(&self, ctx: &ContextId) -> Result<Vec<Cookie>, BrowserError> {
        Ok(self.context(ctx)?.cookies.lock().clone())
    }

    async fn set_cookies(
        &self,
        ctx: &ContextId,
        cookies: &[Cookie],
    ) -> Result<(), BrowserError> {
        let context = self.context(ctx)?;
        let mut jar = context.cookies.lock();
        for cookie in cookies {
            upsert_cookie(&mut jar, cookie.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_browser(dir: &TempDir) -> HttpBrowser {
        HttpBrowser::new(HttpBrowserConfig {
            tab_dir: dir.path().to_path_buf(),
            base_url: "https://shop.example.com".to_string(),
            listing_host: Some("shop.example.com".to_string()),
            listing_url_template: "https://shop.example.com/listing?page={page}".to_string(),
            signed_in_selector: "[data-account-name]".to_string(),
            selectors: ListingSelectors::default(),
            navigation_timeout: Duration::from_secs(1),
            user_agent: "test".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn set_cookie_parsing() {
        let c = parse_set_cookie(
            "session=abc123; Path=/; Domain=.shop.example.com; Secure; HttpOnly",
            "shop.example.com",
        )
        .unwrap();
        assert_eq!(c.name, "session");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain, "shop.example.com");
        assert!(c.secure);
        assert!(c.http_only);

        assert!(parse_set_cookie("=novalue", "h").is_none());
        assert!(parse_set_cookie("garbage", "h").is_none());
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let jar = vec![
            Cookie {
                name: "a".into(),
                value: "1".into(),
                domain: "d".into(),
                path: "/".into(),
                secure: false,
                http_only: false,
                expires: None,
            },
            Cookie {
                name: "b".into(),
                value: "2".into(),
                domain: "d".into(),
                path: "/".into(),
                secure: false,
                http_only: false,
                expires: None,
            },
        ];
        assert_eq!(cookie_header(&jar), "a=1; b=2");
    }

    #[tokio::test]
    async fn spool_round_trip_and_idempotent_close() {
        let dir = TempDir::new().unwrap();
        let browser = test_browser(&dir);

        let path = dir.path().join("page-7.json");
        HttpBrowser::write_spool(
            &path,
            &SpooledTab {
                url: "https://shop.example.com/listing?page=7".to_string(),
                page: Some(7),
                status: TabStatus::Loaded,
                html: "<html></html>".to_string(),
                opened_at: 1,
            },
        )
        .await
        .unwrap();

        let found = browser.find_listing_tab(7).await.unwrap().unwrap();
        assert_eq!(found.page, Some(7));

        let closed = browser
            .close_tabs_in_window(PageRange::new(1, 10))
            .await
            .unwrap();
        assert_eq!(closed, 1);
        // Closing again is a no-op, not an error.
        let closed = browser
            .close_tabs_in_window(PageRange::new(1, 10))
            .await
            .unwrap();
        assert_eq!(closed, 0);
    }

    #[tokio::test]
    async fn failed_tabs_are_not_found() {
        let dir = TempDir::new().unwrap();
        let browser = test_browser(&dir);
        HttpBrowser::write_spool(
            &dir.path().join("page-3.json"),
            &SpooledTab {
                url: "https://shop.example.com/listing?page=3".to_string(),
                page: Some(3),
                status: TabStatus::Failed,
                html: String::new(),
                opened_at: 1,
            },
        )
        .await
        .unwrap();
        assert!(browser.find_listing_tab(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn context_cookie_jar_upserts() {
        let dir = TempDir::new().unwrap();
        let browser = test_browser(&dir);
        let ctx = browser.open_context(None, &[]).await.unwrap();

        let cookie = |v: &str| Cookie {
            name: "session".into(),
            value: v.into(),
            domain: "shop.example.com".into(),
            path: "/".into(),
            secure: false,
            http_only: false,
            expires: None,
        };

        browser.set_cookies(&ctx, &[cookie("one")]).await.unwrap();
        browser.set_cookies(&ctx, &[cookie("two")]).await.unwrap();
        let jar = browser.cookies(&ctx).await.unwrap();
        assert_eq!(jar.len(), 1);
        assert_eq!(jar[0].value, "two");

        browser.close_context(&ctx).await.unwrap();
        assert!(browser.cookies(&ctx).await.is_err());
    }
}
