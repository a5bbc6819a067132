// src/pool.rs

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::worker::{WorkerPhase, WorkerSlot};

struct PoolEntry {
    slot: Arc<WorkerSlot>,
    handle: Option<JoinHandle<()>>,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub spawned: usize,
    pub retired: usize,
}

/// Live workers keyed by id. Higher ids are newer.
pub struct WorkerPool {
    workers: Mutex<BTreeMap<u64, PoolEntry>>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Workers that are not retiring.
    pub fn active_count(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|entry| !entry.slot.is_retiring())
            .count()
    }

    /// Every tracked worker, retiring ones included.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bring the number of active workers to `target`.
    ///
    /// Missing workers are created and handed to `spawn`; excess ones are
    /// retired newest first. Retired workers stay tracked until they exit.
    pub fn reconcile<F>(&self, target: usize, mut spawn: F) -> Reconciled
    where
        F: FnMut(Arc<WorkerSlot>) -> JoinHandle<()>,
    {
        let mut workers = self.workers.lock();
        workers.retain(|_, entry| !entry.handle.as_ref().is_some_and(|h| h.is_finished()));

        let active: Vec<u64> = workers
            .iter()
            .filter(|(_, entry)| !entry.slot.is_retiring())
            .map(|(id, _)| *id)
            .collect();

        let mut outcome = Reconciled::default();
        if active.len() < target {
            for _ in active.len()..target {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let slot = Arc::new(WorkerSlot::new(id));
                let handle = spawn(Arc::clone(&slot));
                workers.insert(id, PoolEntry { slot, handle: Some(handle) });
                outcome.spawned += 1;
            }
        } else {
            for id in active.iter().rev().take(active.len() - target) {
                if let Some(entry) = workers.get(id) {
                    entry.slot.retire();
                    outcome.retired += 1;
                }
            }
        }
        outcome
    }

    /// Called by a worker on its way out.
    pub fn remove(&self, id: u64) {
        self.workers.lock().remove(&id);
    }

    /// Retire every worker, cancelling whatever each one is waiting on.
    pub fn retire_all(&self) -> usize {
        let workers = self.workers.lock();
        for entry in workers.values() {
            entry.slot.retire();
        }
        workers.len()
    }

    pub fn phases(&self) -> Vec<(u64, WorkerPhase)> {
        self.workers
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.slot.phase()))
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
