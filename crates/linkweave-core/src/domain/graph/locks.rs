//! Per-tuple write locks
//!
//! Serializes the check-then-write sequence for one link tuple so two rules
//! discovering the same relationship concurrently cannot both insert it.
//! The partial unique index on active links backs this up across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Slot = Arc<AsyncMutex<()>>;

/// In-process lock table keyed by `LinkKey::lock_key`
#[derive(Debug, Clone, Default)]
pub struct TupleLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl TupleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: impl Into<String>) -> TupleLockGuard {
        let key = key.into();
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        trace!(lock_key = %key, "Tuple lock acquired");
        TupleLockGuard {
            key,
            slot,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Number of tuples currently tracked
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held while a tuple is being written; releases on drop
#[derive(Debug)]
pub struct TupleLockGuard {
    key: String,
    slot: Slot,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl TupleLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TupleLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Our clone plus the map's entry: nobody else is waiting
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
