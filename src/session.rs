//! Shared-session cookie fan-out.
//!
//! Login is a cross-worker singleton without a dedicated owner: whichever
//! worker first holds a working session publishes its cookie jar under
//! `session:cookies` and flips `session:valid`. Every other worker installs
//! the published jar when opening a context and republishes after a
//! successful verification, keeping the shared jar fresh.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::browser::{BrowserDriver, BrowserError, ContextId};
use crate::coordinator::{CoordinatorError, Kv};
use crate::keys::{self, Keyspace, Value};
use crate::models::Cookie;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

pub struct SessionBroker {
    kv: Arc<dyn Kv>,
    keys: Keyspace,
}

impl SessionBroker {
    pub fn new(kv: Arc<dyn Kv>, keys: Keyspace) -> Self {
        Self { kv, keys }
    }

    /// The published jar, if the shared session is currently marked valid
    /// and non-empty.
    pub async fn shared_cookies(&self) -> Result<Option<Vec<Cookie>>, CoordinatorError> {
        let valid = matches!(
            self.kv.get(&self.keys.session_valid()).await?.as_deref(),
            Some("1")
        );
        if !valid {
            return Ok(None);
        }
        let cookies: Value<Vec<Cookie>> =
            keys::read_json(self.kv.as_ref(), &self.keys.session_cookies()).await?;
        match cookies {
            Value::Present(jar) if !jar.is_empty() => Ok(Some(jar)),
            Value::Invalid(raw) => {
                warn!(raw_len = raw.len(), "unreadable shared cookie jar, ignoring");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Install the published jar into a context. Returns whether anything
    /// was installed.
    pub async fn install_shared(
        &self,
        browser: &dyn BrowserDriver,
        ctx: &ContextId,
    ) -> Result<bool, SessionError> {
        match self.shared_cookies().await? {
            Some(jar) => {
                browser.set_cookies(ctx, &jar).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Probe the signed-in indicator. On success publish the context's jar
    /// and mark the shared session valid; on failure mark it invalid.
    pub async fn verify_and_publish(
        &self,
        browser: &dyn BrowserDriver,
        ctx: &ContextId,
    ) -> Result<bool, SessionError> {
        if browser.is_signed_in(ctx).await? {
            let jar = browser.cookies(ctx).await?;
            keys::write_json(self.kv.as_ref(), &self.keys.session_cookies(), &jar).await?;
            self.kv.set(&self.keys.session_valid(), "1").await?;
            info!(cookies = jar.len(), "session verified, cookie jar published");
            Ok(true)
        } else {
            self.kv.set(&self.keys.session_valid(), "0").await?;
            Ok(false)
        }
    }

    /// General-worker path: wait for a human to complete the login in the
    /// visible browser, polling the indicator until `timeout` runs out.
    /// Publishes the jar the moment the login lands.
    pub async fn wait_for_interactive_login(
        &self,
        browser: &dyn BrowserDriver,
        ctx: &ContextId,
        timeout: Duration,
        poll: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        warn!(
            timeout_secs = timeout.as_secs(),
            "session invalid, waiting for interactive login"
        );
        loop {
            if self.verify_and_publish(browser, ctx).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MemoryBrowser;
    use crate::coordinator::MemoryKv;

    fn broker(kv: Arc<MemoryKv>) -> SessionBroker {
        SessionBroker::new(kv, Keyspace::new("fleet"))
    }

    #[tokio::test]
    async fn publish_then_fan_out() {
        let kv = Arc::new(MemoryKv::new());
        let browser = MemoryBrowser::new();
        browser.set_accepted_session("tok-9");
        let broker = broker(kv.clone());

        // First worker logs in interactively and publishes.
        let ctx1 = browser.open_context(None, &[]).await.unwrap();
        assert!(!broker.verify_and_publish(&browser, &ctx1).await.unwrap());
        browser.complete_interactive_login(&ctx1);
        assert!(broker.verify_and_publish(&browser, &ctx1).await.unwrap());

        // Second worker installs the shared jar and is signed in at once.
        let ctx2 = browser.open_context(None, &[]).await.unwrap();
        assert!(broker.install_shared(&browser, &ctx2).await.unwrap());
        assert!(browser.is_signed_in(&ctx2).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_session_is_not_installed() {
        let kv = Arc::new(MemoryKv::new());
        let browser = MemoryBrowser::new();
        let broker = broker(kv.clone());

        kv.set("fleet:session:valid", "0").await.unwrap();
        kv.set("fleet:session:cookies", "[]").await.unwrap();

        let ctx = browser.open_context(None, &[]).await.unwrap();
        assert!(!broker.install_shared(&browser, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn failed_probe_marks_session_invalid() {
        let kv = Arc::new(MemoryKv::new());
        let browser = MemoryBrowser::new();
        let broker = broker(kv.clone());

        let ctx = browser.open_context(None, &[]).await.unwrap();
        assert!(!broker.verify_and_publish(&browser, &ctx).await.unwrap());
        assert_eq!(
            kv.get("fleet:session:valid").await.unwrap(),
            Some("0".to_string())
        );
    }

    #[tokio::test]
    async fn interactive_wait_succeeds_once_human_logs_in() {
        let kv = Arc::new(MemoryKv::new());
        let browser = MemoryBrowser::new();
        browser.set_accepted_session("tok-1");
        let broker = broker(kv.clone());

        let ctx = browser.open_context(None, &[]).await.unwrap();
        browser.complete_interactive_login(&ctx);
        let ok = broker
            .wait_for_interactive_login(
                &browser,
                &ctx,
                Duration::from_millis(200),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            kv.get("fleet:session:valid").await.unwrap(),
            Some("1".to_string())
        );
    }
}
