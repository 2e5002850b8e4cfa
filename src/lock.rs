//! Per-target serialization
//!
//! Connect and disconnect against the same target never interleave. Each
//! target key maps to its own async mutex; different targets never contend.
//! A key is dropped from the table once its last guard is released with
//! nobody else waiting.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Guard held for the duration of one operation on a target
pub struct TargetGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
    key: String,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        // Unlock first so a waiter's clone is the only other reference
        self.guard.take();
        // Under the shard lock: a count of one means only the table holds it
        let removed = self
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
        if removed.is_some() {
            trace!("Released target lock {}", self.key);
        }
    }
}

/// Table of per-target locks, cheap to clone and share between connectors
#[derive(Clone, Default)]
pub struct TargetLocks {
    locks: Arc<LockTable>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &str) -> TargetGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!("Acquiring target lock {}", key);
        let guard = lock.lock_owned().await;
        TargetGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
            key: key.to_string(),
        }
    }

    /// Number of targets currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
