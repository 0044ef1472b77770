//! Batch window bookkeeping and deferred tab closing.
//!
//! The general worker processes its assignment in tab batches. The current
//! window is published under `batch:start`/`batch:end` so product workers
//! and operators can see what is in flight. Finished windows are closed by
//! a background closer fed through a bounded queue: the closer re-checks
//! that no live product worker still lists pages from the window before
//! tearing its tabs down, then closes idempotently.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser::BrowserDriver;
use crate::config::Protocol;
use crate::coordinator::{CoordinatorError, Kv};
use crate::keys::{self, Keyspace, Value, WorkerRole};
use crate::models::PageRange;

/// Publish the in-flight window and reset its completion/readiness flags.
pub async fn publish_window(
    kv: &dyn Kv,
    keys: &Keyspace,
    window: PageRange,
) -> Result<(), CoordinatorError> {
    keys::write_u64(kv, &keys.batch_start(), window.start).await?;
    keys::write_u64(kv, &keys.batch_end(), window.end).await?;
    kv.delete(&keys.batch_complete()).await?;
    kv.delete(&keys.tabs_ready()).await?;
    Ok(())
}

pub async fn read_window(
    kv: &dyn Kv,
    keys: &Keyspace,
) -> Result<Option<PageRange>, CoordinatorError> {
    let start = keys::read_u64(kv, &keys.batch_start()).await?;
    let end = keys::read_u64(kv, &keys.batch_end()).await?;
    Ok(match (start, end) {
        (Value::Present(s), Value::Present(e)) if e >= s => Some(PageRange::new(s, e)),
        _ => None,
    })
}

/// Whether any product worker (live or not) still lists a page inside
/// `window`. Used by the closer as its safety check.
async fn window_still_pending(
    kv: &dyn Kv,
    keys: &Keyspace,
    window: PageRange,
) -> Result<bool, CoordinatorError> {
    for id in 1..=Protocol::MAX_WORKER_ID {
        let pages: Value<Vec<u64>> =
            keys::read_json(kv, &keys.pages(WorkerRole::Product, id)).await?;
        if let Value::Present(pages) = pages {
            if pages.iter().any(|p| window.contains(*p)) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Background closer for finished batches.
///
/// Bounded so a stalled browser applies backpressure to the batch loop
/// instead of piling up windows.
pub struct BatchCloser {
    tx: mpsc::Sender<PageRange>,
    handle: JoinHandle<()>,
}

impl BatchCloser {
    const SAFETY_RETRIES: u32 = 5;

    pub fn spawn(
        browser: Arc<dyn BrowserDriver>,
        kv: Arc<dyn Kv>,
        keys: Keyspace,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<PageRange>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(window) = rx.recv().await {
                for attempt in 0..=Self::SAFETY_RETRIES {
                    match window_still_pending(kv.as_ref(), &keys, window).await {
                        Ok(false) => break,
                        Ok(true) if attempt < Self::SAFETY_RETRIES => {
                            debug!(%window, attempt, "window still pending, delaying close");
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        }
                        Ok(true) => {
                            warn!(%window, "closing window despite pending pages");
                        }
                        Err(e) => {
                            warn!(%window, error = %e, "pending check failed, closing anyway");
                            break;
                        }
                    }
                }
                match browser.close_tabs_in_window(window).await {
                    Ok(closed) => debug!(%window, closed, "batch tabs closed"),
                    Err(e) => warn!(%window, error = %e, "batch tab close failed"),
                }
            }
        });
        Self { tx, handle }
    }

    /// Queue a finished window for closing; waits when the queue is full.
    pub async fn enqueue(&self, window: PageRange) {
        if self.tx.send(window).await.is_err() {
            warn!(%window, "batch closer gone, window not closed");
        }
    }

    /// Drain the queue and stop the closer.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "batch closer task panicked");
        }
    }
}
