//! Product worker: extracts listing records from tabs owned by general
//! workers.
//!
//! Each instance holds `lock:product-<id>`, heartbeats, and drains the page
//! list under `product:<id>:pages`. For every page it locates the matching
//! tab, extracts records, reconciles them against what the store already
//! holds for that page, and writes an audit event per record. The list is
//! re-read before every page so a rebalance performed by the waiting
//! general worker is picked up immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::browser::{BrowserDriver, BrowserError};
use crate::config::Settings;
use crate::coordinator::{CoordinatorError, Kv};
use crate::heartbeat;
use crate::keys::{self, Keyspace, Value, WorkerRole};
use crate::lock::{LeaseLock, LockError};
use crate::models::CrawlEvent;
use crate::storage::{ListingStore, StoreError};

#[derive(Error, Debug)]
pub enum ProductError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ProductWorker {
    id: u32,
    kv: Arc<dyn Kv>,
    keys: Keyspace,
    settings: Settings,
    browser: Arc<dyn BrowserDriver>,
    store: Arc<dyn ListingStore>,
    lock: LeaseLock,
    stop: Arc<AtomicBool>,
}

impl ProductWorker {
    pub fn new(
        kv: Arc<dyn Kv>,
        browser: Arc<dyn BrowserDriver>,
        store: Arc<dyn ListingStore>,
        settings: Settings,
        id: u32,
    ) -> Self {
        let keys = Keyspace::new(&settings.namespace);
        let lock = LeaseLock::new(kv.clone(), keys.worker_lock(WorkerRole::Product, id));
        Self {
            id,
            kv,
            keys,
            settings,
            browser,
            store,
            lock,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take this instance's lock. Contention is fatal to the process.
    pub async fn start(&self) -> Result<(), ProductError> {
        self.lock.acquire().await?;
        info!(id = self.id, "product worker started");
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProductError> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(id = self.id, error = %e, "product tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.product_poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.stop.store(true, Ordering::Relaxed);
        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "lock release failed");
        }
        let _ = heartbeat::clear(self.kv.as_ref(), &self.keys, WorkerRole::Product, self.id).await;
        // Unfinished pages go back to the pool via the next assignment.
        let _ = self
            .kv
            .delete(&self.keys.pages(WorkerRole::Product, self.id))
            .await;
        info!(id = self.id, "product worker shut down");
    }

    pub async fn tick(&self) -> Result<(), ProductError> {
        if self.lock.is_held() {
            if !self.lock.refresh().await? {
                warn!(id = self.id, "instance lock lost, skipping poll");
                return Ok(());
            }
        } else if let Err(e) = self.lock.acquire().await {
            warn!(id = self.id, error = %e, "instance lock not re-acquired");
            return Ok(());
        }

        if let Err(e) =
            heartbeat::beat(self.kv.as_ref(), &self.keys, WorkerRole::Product, self.id).await
        {
            warn!(id = self.id, error = %e, "heartbeat write failed");
        }

        // Retryable "not logged in": stay idle until a general worker (or a
        // human) restores the shared session.
        if matches!(
            self.kv.get(&self.keys.session_valid()).await?.as_deref(),
            Some("0")
        ) {
            debug!(id = self.id, "shared session invalid, retrying next poll");
            return Ok(());
        }

        let list = self.read_list().await?;
        if list.is_empty() {
            let triggered =
                keys::read_flag(self.kv.as_ref(), &self.keys.crawl_trigger()).await?;
            if triggered {
                // Crawl is on but nothing is addressed to us yet; the next
                // fan-out or rebalance will fill the list.
                debug!(id = self.id, "crawl triggered, no pages assigned");
            }
            return Ok(());
        }

        self.drain_list().await?;
        keys::set_flag(
            self.kv.as_ref(),
            &self.keys.complete(WorkerRole::Product, self.id),
        )
        .await?;
        info!(id = self.id, "page list drained");
        Ok(())
    }

    async fn read_list(&self) -> Result<Vec<u64>, ProductError> {
        let list: Value<Vec<u64>> = keys::read_json(
            self.kv.as_ref(),
            &self.keys.pages(WorkerRole::Product, self.id),
        )
        .await?;
        Ok(match list {
            Value::Present(pages) => pages,
            Value::Absent => Vec::new(),
            Value::Invalid(raw) => {
                warn!(id = self.id, %raw, "unreadable page list, treating as empty");
                Vec::new()
            }
        })
    }

    async fn drain_list(&self) -> Result<(), ProductError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            // Re-read every iteration: a rebalance may have shrunk or
            // reordered the list since the previous page.
            let list = self.read_list().await?;
            let Some(&page) = list.first() else {
                return Ok(());
            };

            self.process_page(page).await?;

            let mut current = self.read_list().await?;
            current.retain(|p| *p != page);
            keys::write_json(
                self.kv.as_ref(),
                &self.keys.pages(WorkerRole::Product, self.id),
                &current,
            )
            .await?;
        }
    }

    async fn process_page(&self, page: u64) -> Result<(), ProductError> {
        let listing_url = self.settings.listing_url(page);

        let Some(tab) = self.browser.find_listing_tab(page).await? else {
            // No tab for this page on the host; the page resurfaces in a
            // later cycle rather than being retried here.
            warn!(id = self.id, page, "no open tab found, skipping page");
            return Ok(());
        };

        let records = match self.browser.extract_listing(&tab).await {
            Ok(records) => records,
            Err(e) => {
                warn!(id = self.id, page, error = %e, "extraction failed");
                if let Err(audit) = self
                    .store
                    .record_event(&CrawlEvent::failed(None, &listing_url, page, &e.to_string()))
                    .await
                {
                    warn!(error = %audit, "audit write failed");
                }
                return Ok(());
            }
        };

        // Only replace the page's stored rows when the identifier set
        // actually moved; re-extraction of an unchanged page is a no-op
        // delete-wise and an idempotent upsert otherwise.
        let existing = self.store.list_by_page(page).await?;
        let existing_ids: HashSet<&str> =
            existing.iter().map(|r| r.listing_id.as_str()).collect();
        let new_ids: HashSet<&str> = records.iter().map(|r| r.listing_id.as_str()).collect();
        if existing_ids != new_ids {
            let removed = self.store.delete_by_page(page).await?;
            debug!(id = self.id, page, removed, "page contents changed, cleared old rows");
        }

        let mut stored = 0usize;
        for record in &records {
            match self.store.upsert_record(record).await {
                Ok(()) => {
                    stored += 1;
                    if let Err(e) = self
                        .store
                        .record_event(&CrawlEvent::success(&record.listing_id, &record.url, page))
                        .await
                    {
                        warn!(error = %e, "audit write failed");
                    }
                }
                Err(e) => {
                    warn!(id = self.id, page, listing = %record.listing_id, error = %e,
                          "upsert failed");
                    if let Err(audit) = self
                        .store
                        .record_event(&CrawlEvent::failed(
                            Some(&record.listing_id),
                            &record.url,
                            page,
                            &e.to_string(),
                        ))
                        .await
                    {
                        warn!(error = %audit, "audit write failed");
                    }
                }
            }
        }
        debug!(id = self.id, page, extracted = records.len(), stored, "page processed");
        Ok(())
    }
}
