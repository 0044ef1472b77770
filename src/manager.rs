//! The manager: single-leader controller that partitions the page range.
//!
//! One manager replica holds `lock:manager-1` and runs a 5-second tick:
//! refresh the lock, observe general-worker liveness, and (re)assign page
//! ranges in one of two modes. Even mode keeps the whole range tiled across
//! the live workers; rotation mode walks the range in fixed-size slices
//! handed to workers round-robin. A replica that loses the lock goes quiet
//! and leaves the field to whoever took it.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Protocol, Settings};
use crate::coordinator::{CoordinatorError, Kv};
use crate::heartbeat;
use crate::keys::{self, Keyspace, Value, WorkerRole};
use crate::lock::{LeaseLock, LockError};
use crate::models::PageRange;
use crate::partition::{even_partition, is_contiguous_prefix, rotation_slice};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub struct Manager {
    kv: Arc<dyn Kv>,
    keys: Keyspace,
    settings: Settings,
    lock: LeaseLock,
}

impl Manager {
    pub fn new(kv: Arc<dyn Kv>, settings: Settings) -> Self {
        let keys = Keyspace::new(&settings.namespace);
        let lock = LeaseLock::new(kv.clone(), keys.manager_lock());
        Self {
            kv,
            keys,
            settings,
            lock,
        }
    }

    /// Take the manager lock. Contention is fatal to the process.
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.lock.acquire().await?;
        info!(mode = if self.settings.rotation_enabled { "rotation" } else { "even" },
              "manager started");
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ManagerError> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                // Transport errors are retried on the next tick.
                warn!(error = %e, "manager tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.manager_poll) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.release().await;
        Ok(())
    }

    pub async fn release(&self) {
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "manager lock release failed");
        }
    }

    /// One scheduling pass. Public so the protocol can be driven in tests.
    pub async fn tick(&self) -> Result<(), ManagerError> {
        if !self.lock.refresh().await? {
            warn!("manager lock lost, going quiet this tick");
            return Ok(());
        }

        let total_pages = match keys::read_u64(self.kv.as_ref(), &self.keys.total_pages()).await? {
            Value::Present(t) if t > 0 => t,
            Value::Present(_) | Value::Absent => return Ok(()),
            Value::Invalid(raw) => {
                warn!(%raw, "totalPages unreadable, resetting to 0");
                keys::write_u64(self.kv.as_ref(), &self.keys.total_pages(), 0).await?;
                return Ok(());
            }
        };

        let live = heartbeat::live_ids(self.kv.as_ref(), &self.keys, WorkerRole::General).await?;
        debug!(?live, total_pages, "manager tick");

        if self.settings.rotation_enabled {
            self.assign_rotation(total_pages, &live).await?;
        } else {
            self.sweep_dead_workers(&live).await?;
            self.assign_even(total_pages, &live).await?;
        }
        Ok(())
    }

    /// Drop assignment keys left behind by workers that fell out of the
    /// liveness window, so their ranges return to the pool.
    async fn sweep_dead_workers(&self, live: &[u32]) -> Result<(), CoordinatorError> {
        for id in 1..=Protocol::MAX_WORKER_ID {
            if live.contains(&id) {
                continue;
            }
            let pages_key = self.keys.pages(WorkerRole::General, id);
            if self.kv.get(&pages_key).await?.is_some() {
                info!(id, "clearing assignment of dead general worker");
                self.kv.delete(&pages_key).await?;
                self.kv
                    .delete(&self.keys.complete(WorkerRole::General, id))
                    .await?;
                self.kv.delete(&self.keys.processing(id)).await?;
            }
        }
        Ok(())
    }

    async fn assign_even(&self, total_pages: u64, live: &[u32]) -> Result<(), CoordinatorError> {
        if live.is_empty() {
            return Ok(());
        }

        let mut assigned: Vec<(u32, Option<PageRange>)> = Vec::with_capacity(live.len());
        let mut any_missing = false;
        let mut any_finished_short = false;
        for &id in live {
            let range: Value<PageRange> =
                keys::read_json(self.kv.as_ref(), &self.keys.pages(WorkerRole::General, id))
                    .await?;
            let range = match range {
                Value::Present(r) => Some(r),
                Value::Absent => {
                    any_missing = true;
                    None
                }
                Value::Invalid(raw) => {
                    warn!(id, %raw, "unreadable page assignment, treating as missing");
                    any_missing = true;
                    None
                }
            };
            if let Some(r) = range {
                let complete =
                    keys::read_flag(self.kv.as_ref(), &self.keys.complete(WorkerRole::General, id))
                        .await?;
                if complete && r.end < total_pages {
                    any_finished_short = true;
                }
            }
            assigned.push((id, range));
        }

        let ranges: Vec<PageRange> = assigned.iter().filter_map(|(_, r)| *r).collect();
        let tiled = ranges.len() == live.len() && is_contiguous_prefix(&ranges, total_pages);

        if !any_missing && tiled && !any_finished_short {
            return Ok(());
        }

        let parts = even_partition(total_pages, live);
        info!(workers = live.len(), total_pages, "even reassignment");
        for &id in live {
            if keys::read_flag(self.kv.as_ref(), &self.keys.processing(id)).await? {
                debug!(id, "worker mid-batch, leaving assignment untouched");
                continue;
            }
            match parts.iter().find(|(pid, _)| *pid == id) {
                Some((_, range)) => {
                    keys::write_json(
                        self.kv.as_ref(),
                        &self.keys.pages(WorkerRole::General, id),
                        range,
                    )
                    .await?;
                }
                None => {
                    // More workers than chunks: nothing for this id.
                    self.kv
                        .delete(&self.keys.pages(WorkerRole::General, id))
                        .await?;
                }
            }
            self.kv
                .delete(&self.keys.complete(WorkerRole::General, id))
                .await?;
        }
        Ok(())
    }

    async fn assign_rotation(
        &self,
        total_pages: u64,
        live: &[u32],
    ) -> Result<(), CoordinatorError> {
        let index_key = self.keys.rotation_index();
        let last_key = self.keys.rotation_last_assigned();

        let index = keys::read_u64(self.kv.as_ref(), &index_key).await?;
        let index = match index {
            Value::Invalid(raw) => {
                warn!(%raw, "rotation index unreadable, resetting to 0");
                keys::write_u64(self.kv.as_ref(), &index_key, 0).await?;
                0
            }
            other => other.unwrap_or_warn(&index_key, 0),
        };
        let last = keys::read_u64(self.kv.as_ref(), &last_key).await?;
        let last = match last {
            Value::Invalid(raw) => {
                warn!(%raw, "rotation cursor unreadable, resetting to 0");
                keys::write_u64(self.kv.as_ref(), &last_key, 0).await?;
                0
            }
            other => other.unwrap_or_warn(&last_key, 0),
        };

        // Cycle exhausted: wipe the slate so the next tick starts over.
        // Ids outside the live set are cleared too, so a worker that died
        // mid-cycle cannot resurrect with a stale assignment.
        if last >= total_pages {
            info!(total_pages, "rotation cycle complete, resetting");
            keys::write_u64(self.kv.as_ref(), &index_key, 0).await?;
            keys::write_u64(self.kv.as_ref(), &last_key, 0).await?;
            for id in 1..=Protocol::MAX_WORKER_ID {
                self.kv
                    .delete(&self.keys.pages(WorkerRole::General, id))
                    .await?;
                self.kv
                    .delete(&self.keys.complete(WorkerRole::General, id))
                    .await?;
            }
            return Ok(());
        }

        if live.is_empty() {
            return Ok(());
        }

        let mut should_assign = false;
        for &id in live {
            let missing = self
                .kv
                .get(&self.keys.pages(WorkerRole::General, id))
                .await?
                .is_none();
            let complete =
                keys::read_flag(self.kv.as_ref(), &self.keys.complete(WorkerRole::General, id))
                    .await?;
            if missing || complete {
                should_assign = true;
                break;
            }
        }
        if !should_assign {
            return Ok(());
        }

        let Some(slice) = rotation_slice(last, total_pages, self.settings.rotation_batch_size)
        else {
            return Ok(());
        };

        // Membership may have shrunk since the index was last advanced.
        let target = live[(index as usize) % live.len()];
        info!(worker = target, range = %slice, "rotation hand-out");
        keys::write_json(
            self.kv.as_ref(),
            &self.keys.pages(WorkerRole::General, target),
            &slice,
        )
        .await?;
        self.kv
            .delete(&self.keys.complete(WorkerRole::General, target))
            .await?;
        keys::write_u64(self.kv.as_ref(), &index_key, index + 1).await?;
        keys::write_u64(self.kv.as_ref(), &last_key, slice.end).await?;
        Ok(())
    }
}
