//! Heartbeats and liveness-based membership.
//!
//! Each worker stamps `<role>:<id>:heartbeat` with unix millis on every
//! loop. Membership is recomputed on demand by scanning ids
//! `1..=MAX_WORKER_ID` and keeping those whose stamp is within the
//! liveness window. Heartbeat writes are fire-and-forget: a failed write is
//! logged and retried on the next loop.

use crate::config::Protocol;
use crate::coordinator::{now_millis, CoordinatorError, Kv};
use crate::keys::{Keyspace, WorkerRole};
use tracing::warn;

/// Stamp this worker's heartbeat with the current time.
pub async fn beat(
    kv: &dyn Kv,
    keys: &Keyspace,
    role: WorkerRole,
    id: u32,
) -> Result<(), CoordinatorError> {
    let key = keys.heartbeat(role, id);
    kv.set(&key, &now_millis().to_string()).await
}

/// Remove this worker's heartbeat on graceful shutdown.
pub async fn clear(
    kv: &dyn Kv,
    keys: &Keyspace,
    role: WorkerRole,
    id: u32,
) -> Result<(), CoordinatorError> {
    kv.delete(&keys.heartbeat(role, id)).await
}

/// Whether one worker's heartbeat is within the liveness window.
pub async fn is_live(
    kv: &dyn Kv,
    keys: &Keyspace,
    role: WorkerRole,
    id: u32,
    window_ms: u64,
) -> Result<bool, CoordinatorError> {
    let key = keys.heartbeat(role, id);
    match kv.get(&key).await? {
        None => Ok(false),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(at) => Ok(now_millis().saturating_sub(at) <= window_ms),
            Err(_) => {
                warn!(%key, %raw, "unparseable heartbeat, treating as dead");
                Ok(false)
            }
        },
    }
}

/// Live worker ids for a role, ascending. Scans `1..=MAX_WORKER_ID`.
pub async fn live_ids(
    kv: &dyn Kv,
    keys: &Keyspace,
    role: WorkerRole,
) -> Result<Vec<u32>, CoordinatorError> {
    live_ids_within(kv, keys, role, Protocol::LIVENESS_WINDOW_MS).await
}

pub async fn live_ids_within(
    kv: &dyn Kv,
    keys: &Keyspace,
    role: WorkerRole,
    window_ms: u64,
) -> Result<Vec<u32>, CoordinatorError> {
    let mut out = Vec::new();
    for id in 1..=Protocol::MAX_WORKER_ID {
        if is_live(kv, keys, role, id, window_ms).await? {
            out.push(id);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryKv;

    fn keyspace() -> Keyspace {
        Keyspace::new("fleet")
    }

    #[tokio::test]
    async fn beat_makes_worker_live() {
        let kv = MemoryKv::new();
        let keys = keyspace();
        assert!(!is_live(&kv, &keys, WorkerRole::General, 1, 60_000)
            .await
            .unwrap());
        beat(&kv, &keys, WorkerRole::General, 1).await.unwrap();
        assert!(is_live(&kv, &keys, WorkerRole::General, 1, 60_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_heartbeat_is_dead() {
        let kv = MemoryKv::new();
        let keys = keyspace();
        let stale = now_millis() - 61_000;
        kv.set(&keys.heartbeat(WorkerRole::Product, 2), &stale.to_string())
            .await
            .unwrap();
        assert!(!is_live(&kv, &keys, WorkerRole::Product, 2, 60_000)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn membership_is_sorted_and_windowed() {
        let kv = MemoryKv::new();
        let keys = keyspace();
        beat(&kv, &keys, WorkerRole::General, 3).await.unwrap();
        beat(&kv, &keys, WorkerRole::General, 1).await.unwrap();
        let stale = now_millis() - 120_000;
        kv.set(&keys.heartbeat(WorkerRole::General, 2), &stale.to_string())
            .await
            .unwrap();
        // Unparseable stamps are dead, not errors.
        kv.set(&keys.heartbeat(WorkerRole::General, 4), "soon")
            .await
            .unwrap();

        let live = live_ids(&kv, &keys, WorkerRole::General).await.unwrap();
        assert_eq!(live, vec![1, 3]);
    }

    #[tokio::test]
    async fn clear_removes_membership() {
        let kv = MemoryKv::new();
        let keys = keyspace();
        beat(&kv, &keys, WorkerRole::Product, 5).await.unwrap();
        clear(&kv, &keys, WorkerRole::Product, 5).await.unwrap();
        let live = live_ids(&kv, &keys, WorkerRole::Product).await.unwrap();
        assert!(live.is_empty());
    }
}
