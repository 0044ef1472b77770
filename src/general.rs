//! General worker: drives a tab window over its assigned page range.
//!
//! Each instance holds `lock:general-<id>`, heartbeats, and watches
//! `general:<id>:pages` for an assignment from the manager. An assignment
//! is processed as a sequence of tab batches: open the window's tabs with
//! human-like pacing, fan the page numbers out to live product workers,
//! release them via `tabsReady`/`crawlTrigger`, wait for every list to
//! drain (rebalancing stragglers meanwhile), then hand the window to the
//! background closer. After the last window the worker flags itself
//! complete and waits for the next assignment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::{uniform_pause, ExponentialBackoff};
use crate::batch::{self, BatchCloser};
use crate::browser::{BrowserDriver, BrowserError, ContextId};
use crate::config::{Protocol, Settings, TabOpenStrategy};
use crate::coordinator::{CoordinatorError, Kv};
use crate::heartbeat;
use crate::keys::{self, Keyspace, Value, WorkerRole};
use crate::lock::{LeaseLock, LockError};
use crate::models::PageRange;
use crate::partition::split_round_robin;
use crate::rebalance::{plan_rebalance, WorkerLoad};
use crate::session::{SessionBroker, SessionError};

/// Attempts per navigation before a page or discovery pass is given up.
const NAV_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum GeneralError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct GeneralWorker {
    id: u32,
    kv: Arc<dyn Kv>,
    keys: Keyspace,
    settings: Settings,
    browser: Arc<dyn BrowserDriver>,
    lock: LeaseLock,
    session: SessionBroker,
    context: tokio::sync::Mutex<Option<ContextId>>,
    logged_in: AtomicBool,
    processing: AtomicBool,
    stop: Arc<AtomicBool>,
    last_completed: parking_lot::Mutex<Option<PageRange>>,
}

impl GeneralWorker {
    pub fn new(
        kv: Arc<dyn Kv>,
        browser: Arc<dyn BrowserDriver>,
        settings: Settings,
        id: u32,
    ) -> Self {
        let keys = Keyspace::new(&settings.namespace);
        let lock = LeaseLock::new(kv.clone(), keys.worker_lock(WorkerRole::General, id));
        let session = SessionBroker::new(kv.clone(), keys.clone());
        Self {
            id,
            kv,
            keys,
            settings,
            browser,
            lock,
            session,
            context: tokio::sync::Mutex::new(None),
            logged_in: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            last_completed: parking_lot::Mutex::new(None),
        }
    }

    /// Take this instance's lock. Contention is fatal to the process.
    pub async fn start(&self) -> Result<(), GeneralError> {
        self.lock.acquire().await?;
        info!(id = self.id, "general worker started");
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), GeneralError> {
        let stop = self.stop.clone();
        let mut shutdown_watch = shutdown.clone();
        tokio::spawn(async move {
            while shutdown_watch.changed().await.is_ok() {
                if *shutdown_watch.borrow() {
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });

        loop {
            if *shutdown.borrow() || self.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(id = self.id, error = %e, "general tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.general_poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "lock release failed");
        }
        let _ = heartbeat::clear(self.kv.as_ref(), &self.keys, WorkerRole::General, self.id).await;
        let _ = self.kv.delete(&self.keys.processing(self.id)).await;
        let mut guard = self.context.lock().await;
        if let Some(ctx) = guard.take() {
            let _ = self.browser.close_context(&ctx).await;
        }
        info!(id = self.id, "general worker shut down");
    }

    pub async fn tick(&self) -> Result<(), GeneralError> {
        if self.lock.is_held() {
            if !self.lock.refresh().await? {
                warn!(id = self.id, "instance lock lost, skipping tick");
                return Ok(());
            }
        } else if let Err(e) = self.lock.acquire().await {
            warn!(id = self.id, error = %e, "instance lock not re-acquired");
            return Ok(());
        }

        if let Err(e) =
            heartbeat::beat(self.kv.as_ref(), &self.keys, WorkerRole::General, self.id).await
        {
            warn!(id = self.id, error = %e, "heartbeat write failed");
        }

        // Reentrance guard: the outer loop must never start a second
        // assignment while one is in flight.
        if self.processing.load(Ordering::Relaxed) {
            return Ok(());
        }

        let ctx = self.ensure_context().await?;

        if !self.logged_in.load(Ordering::Relaxed) {
            if !self.try_login(&ctx).await? {
                // Keep waiting across ticks; a general worker never dies
                // over a missing login.
                return Ok(());
            }
            self.logged_in.store(true, Ordering::Relaxed);
        }

        self.discover_totals(&ctx).await?;

        let assignment: Value<PageRange> = keys::read_json(
            self.kv.as_ref(),
            &self.keys.pages(WorkerRole::General, self.id),
        )
        .await?;
        let range = match assignment {
            Value::Present(r) => r,
            Value::Absent => return Ok(()),
            Value::Invalid(raw) => {
                warn!(id = self.id, %raw, "unreadable assignment, waiting for manager");
                return Ok(());
            }
        };

        let complete = keys::read_flag(
            self.kv.as_ref(),
            &self.keys.complete(WorkerRole::General, self.id),
        )
        .await?;
        if complete && *self.last_completed.lock() == Some(range) {
            return Ok(());
        }

        self.run_assignment(range).await
    }

    async fn ensure_context(&self) -> Result<ContextId, GeneralError> {
        let mut guard = self.context.lock().await;
        if let Some(ctx) = guard.as_ref() {
            return Ok(ctx.clone());
        }
        let cookies = self.session.shared_cookies().await?.unwrap_or_default();
        let ctx = self
            .browser
            .open_context(self.settings.proxy.as_ref(), &cookies)
            .await?;
        *guard = Some(ctx.clone());
        Ok(ctx)
    }

    /// Shared-cookie login, falling back to an interactive wait.
    async fn try_login(&self, ctx: &ContextId) -> Result<bool, GeneralError> {
        self.session.install_shared(self.browser.as_ref(), ctx).await?;
        if self
            .session
            .verify_and_publish(self.browser.as_ref(), ctx)
            .await?
        {
            return Ok(true);
        }
        let ok = self
            .session
            .wait_for_interactive_login(
                self.browser.as_ref(),
                ctx,
                self.settings.login_wait,
                self.settings.general_poll,
            )
            .await?;
        Ok(ok)
    }

    /// Growing delays for navigation retries against the listing domain,
    /// starting at the configured unavailable backoff.
    fn navigation_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.settings.unavailable_backoff,
            self.settings.unavailable_backoff * 4,
        )
    }

    /// General workers are the sole source of the discovered totals.
    async fn discover_totals(&self, ctx: &ContextId) -> Result<(), GeneralError> {
        let backoff = self.navigation_backoff();
        for attempt in 0..NAV_RETRIES {
            match self.browser.discover_totals(ctx).await {
                Ok((total_pages, total_products)) => {
                    keys::write_u64(self.kv.as_ref(), &self.keys.total_pages(), total_pages)
                        .await?;
                    keys::write_u64(
                        self.kv.as_ref(),
                        &self.keys.total_products(),
                        total_products,
                    )
                    .await?;
                    debug!(total_pages, total_products, "totals published");
                    return Ok(());
                }
                Err(BrowserError::ServiceUnavailable { url }) => {
                    let delay = backoff.delay(attempt);
                    warn!(%url, attempt, delay_secs = delay.as_secs(),
                          "listing unavailable during discovery");
                    if self.stop.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, "total discovery failed");
                    return Ok(());
                }
            }
        }
        warn!("listing still unavailable, deferring discovery to the next tick");
        Ok(())
    }

    async fn run_assignment(&self, range: PageRange) -> Result<(), GeneralError> {
        self.processing.store(true, Ordering::Relaxed);
        keys::set_flag(self.kv.as_ref(), &self.keys.processing(self.id)).await?;
        self.kv
            .delete(&self.keys.complete(WorkerRole::General, self.id))
            .await?;
        info!(id = self.id, %range, "assignment accepted");

        let result = self.drive_batches(range).await;

        self.kv.delete(&self.keys.processing(self.id)).await?;
        self.processing.store(false, Ordering::Relaxed);

        if result.is_ok() {
            keys::set_flag(
                self.kv.as_ref(),
                &self.keys.complete(WorkerRole::General, self.id),
            )
            .await?;
            *self.last_completed.lock() = Some(range);
            info!(id = self.id, %range, "assignment drained");
        }
        result
    }

    async fn drive_batches(&self, range: PageRange) -> Result<(), GeneralError> {
        let closer = BatchCloser::spawn(
            self.browser.clone(),
            self.kv.clone(),
            self.keys.clone(),
            4,
        );

        for window in range.windows(self.settings.tabs_per_batch) {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            if self.settings.context_per_batch {
                self.rotate_context().await?;
            }
            let ctx = self.ensure_context().await?;

            self.open_tabs(&ctx, window).await?;
            batch::publish_window(self.kv.as_ref(), &self.keys, window).await?;
            self.assign_product_workers(window).await?;

            // Ordering matters: assignments land before the ready flags so a
            // product worker can never see tabsReady with a stale list.
            keys::set_flag(self.kv.as_ref(), &self.keys.tabs_ready()).await?;
            keys::set_flag(self.kv.as_ref(), &self.keys.crawl_trigger()).await?;

            self.wait_for_drain(window).await?;
            keys::set_flag(self.kv.as_ref(), &self.keys.batch_complete()).await?;
            closer.enqueue(window).await;
        }

        closer.shutdown().await;
        Ok(())
    }

    async fn rotate_context(&self) -> Result<(), GeneralError> {
        let mut guard = self.context.lock().await;
        if let Some(old) = guard.take() {
            let _ = self.browser.close_context(&old).await;
        }
        let cookies = self.session.shared_cookies().await?.unwrap_or_default();
        let ctx = self
            .browser
            .open_context(self.settings.proxy.as_ref(), &cookies)
            .await?;
        *guard = Some(ctx);
        Ok(())
    }

    async fn open_tabs(&self, ctx: &ContextId, window: PageRange) -> Result<(), GeneralError> {
        let backoff = self.navigation_backoff();
        match self.settings.tab_open_strategy {
            TabOpenStrategy::Sequential => {
                for page in window.pages() {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    self.open_one_tab(ctx, page, &backoff, 0).await;
                    tokio::time::sleep(uniform_pause(self.settings.tab_open_delay)).await;
                }
            }
            TabOpenStrategy::Parallel => {
                let mut set = tokio::task::JoinSet::new();
                for page in window.pages() {
                    let browser = self.browser.clone();
                    let ctx = ctx.clone();
                    let url = self.settings.listing_url(page);
                    set.spawn(async move {
                        let result = browser.open_tab(&ctx, &url).await;
                        (page, result)
                    });
                }
                let mut unavailable = Vec::new();
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((page, Err(BrowserError::ServiceUnavailable { .. }))) => {
                            unavailable.push(page);
                        }
                        Ok((page, Err(e))) => {
                            warn!(page, error = %e, "tab open failed");
                        }
                        Ok((_, Ok(()))) => {}
                        Err(e) => warn!(error = %e, "tab open task failed"),
                    }
                }
                // The throttle answer applies to the whole domain: take the
                // first backoff step once for the wave, then retry each page
                // with the later, longer steps.
                if !unavailable.is_empty() {
                    let delay = backoff.delay(0);
                    warn!(pages = unavailable.len(), delay_secs = delay.as_secs(),
                          "listing unavailable, backing off");
                    tokio::time::sleep(delay).await;
                    for page in unavailable {
                        self.open_one_tab(ctx, page, &backoff, 1).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Open one tab, backing off with growing delays on the listing
    /// domain's "service unavailable" answer. `first_attempt` offsets into
    /// the backoff schedule for pages that already failed once. Other
    /// failures demote to warnings and the page is skipped for this batch.
    async fn open_one_tab(
        &self,
        ctx: &ContextId,
        page: u64,
        backoff: &ExponentialBackoff,
        first_attempt: u32,
    ) {
        let url = self.settings.listing_url(page);
        for attempt in first_attempt..first_attempt + NAV_RETRIES {
            match self.browser.open_tab(ctx, &url).await {
                Ok(()) => return,
                Err(BrowserError::ServiceUnavailable { .. }) => {
                    let delay = backoff.delay(attempt);
                    warn!(page, attempt, delay_secs = delay.as_secs(),
                          "listing unavailable, backing off before retry");
                    if self.stop.load(Ordering::Relaxed) {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(page, error = %e, "tab open failed, skipping page");
                    return;
                }
            }
        }
        warn!(page, "listing still unavailable, giving up on page");
    }

    /// Partition the window's pages across the live product workers by
    /// position, write each slice, and clear lists of ids not live.
    async fn assign_product_workers(&self, window: PageRange) -> Result<(), GeneralError> {
        let live =
            heartbeat::live_ids(self.kv.as_ref(), &self.keys, WorkerRole::Product).await?;
        let targets: Vec<u32> = if live.is_empty() {
            // Nobody has heartbeat yet; address the configured fleet.
            (1..=self.settings.product_worker_total).collect()
        } else {
            live
        };

        let pages: Vec<u64> = window.pages().collect();
        let buckets = split_round_robin(&pages, targets.len());

        for (slot, &id) in targets.iter().enumerate() {
            keys::write_json(
                self.kv.as_ref(),
                &self.keys.pages(WorkerRole::Product, id),
                &buckets[slot],
            )
            .await?;
            self.kv
                .delete(&self.keys.complete(WorkerRole::Product, id))
                .await?;
        }
        for id in 1..=Protocol::MAX_WORKER_ID {
            if !targets.contains(&id) {
                self.kv
                    .delete(&self.keys.pages(WorkerRole::Product, id))
                    .await?;
            }
        }
        debug!(id = self.id, %window, workers = targets.len(), "pages fanned out");
        Ok(())
    }

    /// Poll until every live product worker's list is empty, rebalancing
    /// from stragglers to idle workers once per poll.
    async fn wait_for_drain(&self, window: PageRange) -> Result<(), GeneralError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            if let Err(e) =
                heartbeat::beat(self.kv.as_ref(), &self.keys, WorkerRole::General, self.id).await
            {
                warn!(error = %e, "heartbeat write failed during drain wait");
            }
            if self.lock.is_held() && !self.lock.refresh().await? {
                warn!(id = self.id, "instance lock lost during drain wait");
            }

            let live =
                heartbeat::live_ids(self.kv.as_ref(), &self.keys, WorkerRole::Product).await?;
            let mut loads = Vec::with_capacity(live.len());
            for &id in &live {
                let pages: Value<Vec<u64>> = keys::read_json(
                    self.kv.as_ref(),
                    &self.keys.pages(WorkerRole::Product, id),
                )
                .await?;
                let pages = match pages {
                    Value::Present(p) => p,
                    Value::Absent => Vec::new(),
                    Value::Invalid(raw) => {
                        warn!(id, %raw, "unreadable product list, treating as empty");
                        Vec::new()
                    }
                };
                loads.push(WorkerLoad { id, pages });
            }

            if loads.iter().all(|w| w.pages.is_empty()) {
                debug!(id = self.id, %window, "batch drained");
                return Ok(());
            }

            if let Some(plan) = plan_rebalance(&loads) {
                info!(
                    donor = plan.donor,
                    moved = plan.grants.iter().map(|(_, g)| g.len()).sum::<usize>(),
                    "rebalancing product lists"
                );
                keys::write_json(
                    self.kv.as_ref(),
                    &self.keys.pages(WorkerRole::Product, plan.donor),
                    &plan.donor_remaining,
                )
                .await?;
                for (id, grant) in &plan.grants {
                    keys::write_json(
                        self.kv.as_ref(),
                        &self.keys.pages(WorkerRole::Product, *id),
                        grant,
                    )
                    .await?;
                }
            }

            tokio::time::sleep(self.settings.batch_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MemoryBrowser;
    use crate::coordinator::MemoryKv;
    use std::time::Duration;

    fn test_settings() -> Settings {
        Settings {
            namespace: "fleet".to_string(),
            tabs_per_batch: 10,
            tab_open_delay: (Duration::ZERO, Duration::ZERO),
            batch_poll: Duration::from_millis(10),
            general_poll: Duration::from_millis(10),
            login_wait: Duration::from_millis(50),
            product_worker_total: 2,
            ..Settings::default()
        }
    }

    /// Stand-in for product workers: keeps draining every assigned list.
    fn spawn_drainer(kv: Arc<MemoryKv>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let keys = Keyspace::new("fleet");
            loop {
                for id in 1..=4u32 {
                    let key = keys.pages(WorkerRole::Product, id);
                    if let Some(raw) = kv.get(&key).await.unwrap() {
                        if raw != "[]" {
                            kv.set(&key, "[]").await.unwrap();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    async fn logged_in_worker(
        kv: Arc<MemoryKv>,
        browser: Arc<MemoryBrowser>,
    ) -> GeneralWorker {
        browser.set_accepted_session("tok");
        let worker = GeneralWorker::new(kv, browser.clone(), test_settings(), 1);
        worker.start().await.unwrap();
        // Pre-publish a valid session so ticks do not wait for a human.
        let ctx = worker.ensure_context().await.unwrap();
        browser.complete_interactive_login(&ctx);
        worker
    }

    #[tokio::test]
    async fn idle_without_assignment() {
        let kv = Arc::new(MemoryKv::new());
        let browser = Arc::new(MemoryBrowser::new());
        browser.set_totals(100, 2400);
        let worker = logged_in_worker(kv.clone(), browser).await;

        worker.tick().await.unwrap();
        // Totals are discovered and published even while unassigned.
        assert_eq!(
            kv.get("fleet:totalPages").await.unwrap(),
            Some("100".to_string())
        );
        assert!(kv.get("fleet:general:1:complete").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assignment_runs_batches_and_completes() {
        let kv = Arc::new(MemoryKv::new());
        let browser = Arc::new(MemoryBrowser::new());
        browser.set_totals(25, 600);
        let worker = logged_in_worker(kv.clone(), browser.clone()).await;
        let drainer = spawn_drainer(kv.clone());

        let keys = Keyspace::new("fleet");
        keys::write_json(kv.as_ref(), &keys.pages(WorkerRole::General, 1), &PageRange::new(1, 25))
            .await
            .unwrap();
        // Two product workers are live.
        heartbeat::beat(kv.as_ref(), &keys, WorkerRole::Product, 1).await.unwrap();
        heartbeat::beat(kv.as_ref(), &keys, WorkerRole::Product, 2).await.unwrap();

        worker.tick().await.unwrap();
        drainer.abort();

        assert_eq!(
            kv.get("fleet:general:1:complete").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(
            kv.get("fleet:batchComplete").await.unwrap(),
            Some("1".to_string())
        );
        // The processing guard is released.
        assert!(kv.get("fleet:general:1:processing").await.unwrap().is_none());
        // All batch windows were handed to the closer and tabs torn down.
        assert_eq!(browser.open_tab_count(), 0);
    }

    #[tokio::test]
    async fn completed_assignment_is_not_rerun() {
        let kv = Arc::new(MemoryKv::new());
        let browser = Arc::new(MemoryBrowser::new());
        browser.set_totals(10, 240);
        let worker = logged_in_worker(kv.clone(), browser.clone()).await;
        let drainer = spawn_drainer(kv.clone());

        let keys = Keyspace::new("fleet");
        keys::write_json(kv.as_ref(), &keys.pages(WorkerRole::General, 1), &PageRange::new(1, 10))
            .await
            .unwrap();
        worker.tick().await.unwrap();
        assert_eq!(browser.open_tab_count(), 0);

        // Same range, complete flag still set: the next tick must wait
        // instead of reopening tabs.
        worker.tick().await.unwrap();
        drainer.abort();
        assert_eq!(browser.open_tab_count(), 0);
        assert_eq!(
            kv.get("fleet:general:1:complete").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn unavailable_navigation_retries_until_outage_clears() {
        let kv = Arc::new(MemoryKv::new());
        let browser = Arc::new(MemoryBrowser::new());
        let settings = Settings {
            unavailable_backoff: Duration::from_millis(5),
            ..test_settings()
        };
        let worker = GeneralWorker::new(kv, browser.clone(), settings, 1);

        browser.mark_unavailable(3);
        let ctx = worker.ensure_context().await.unwrap();

        // The outage outlasts the first backoff step but not the second.
        let clearer = browser.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(8)).await;
            clearer.clear_unavailable(3);
        });

        let backoff = worker.navigation_backoff();
        worker.open_one_tab(&ctx, 3, &backoff, 0).await;
        assert!(browser.find_listing_tab(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn falls_back_to_configured_product_fleet() {
        let kv = Arc::new(MemoryKv::new());
        let browser = Arc::new(MemoryBrowser::new());
        browser.set_totals(4, 96);
        let worker = logged_in_worker(kv.clone(), browser).await;
        let drainer = spawn_drainer(kv.clone());

        let keys = Keyspace::new("fleet");
        keys::write_json(kv.as_ref(), &keys.pages(WorkerRole::General, 1), &PageRange::new(1, 4))
            .await
            .unwrap();
        // No product heartbeat at all: the configured total (2) is used.
        worker.tick().await.unwrap();
        drainer.abort();

        assert_eq!(
            kv.get("fleet:general:1:complete").await.unwrap(),
            Some("1".to_string())
        );
    }
}
