//! Per-run exclusive leases.
//!
//! At most one caller mutates a run at a time. A lease is a guard: it is
//! released when dropped, on every exit path. Within a process callers
//! queue on an async mutex per run; across processes the store's own hold
//! ([`RunStore::try_lease`]) is taken while the mutex is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::store::{RunStore, StoreError, StoreLease};

/// Lease table shared by every executor handle
#[derive(Debug, Default)]
pub struct RunLeases {
    slots: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

/// Exclusive right to mutate one run
#[derive(Debug)]
pub struct RunLease {
    run_id: Uuid,
    // Dropped before the in-process guard
    _held: Option<StoreLease>,
    _guard: OwnedMutexGuard<()>,
}

impl RunLease {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl RunLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, run_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop slots nobody holds or waits on
        slots.retain(|id, slot| *id == run_id || Arc::strong_count(slot) > 1);
        slots.entry(run_id).or_default().clone()
    }

    /// Take the in-process lease, or `None` if another caller holds it
    pub fn try_acquire(&self, run_id: Uuid) -> Option<RunLease> {
        self.slot(run_id).try_lock_owned().ok().map(|guard| RunLease {
            run_id,
            _held: None,
            _guard: guard,
        })
    }

    /// Take the lease here and in `store`, or `None` if either is held
    pub async fn try_acquire_in(
        &self,
        store: &dyn RunStore,
        run_id: Uuid,
    ) -> Result<Option<RunLease>, StoreError> {
        let Ok(guard) = self.slot(run_id).try_lock_owned() else {
            return Ok(None);
        };
        let Some(held) = store.try_lease(run_id).await? else {
            return Ok(None);
        };

        Ok(Some(RunLease {
            run_id,
            _held: Some(held),
            _guard: guard,
        }))
    }

    /// Wait for the lease here and in `store`
    pub async fn acquire_in(&self, store: &dyn RunStore, run_id: Uuid) -> Result<RunLease, StoreError> {
        let guard = self.slot(run_id).lock_owned().await;
        let held = store.lease(run_id).await?;

        Ok(RunLease {
            run_id,
            _held: Some(held),
            _guard: guard,
        })
    }

    /// Whether a lease on `run_id` is currently held
    pub fn is_held(&self, run_id: Uuid) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(&run_id)
            .map_or(false, |slot| slot.try_lock().is_err())
    }
}
