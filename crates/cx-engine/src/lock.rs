//! Per-Key Locking
//!
//! Everything the engine does to a correlation key happens inside that
//! key's critical section. Inbound handling and timeout handling contend
//! on the same lock, so at most one of them runs per key at any instant.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held lock on a correlation key. Dropping the value releases the lock.
pub trait KeyLock: Send {}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Blocks until the key's lock is available.
    async fn acquire(&self, key: &str) -> Box<dyn KeyLock>;

    /// Discards the lock entry for a key whose aggregation is finished.
    /// Only call once the key is closed: a task still holding or awaiting
    /// the old entry finishes against state that is already tombstoned.
    fn remove(&self, key: &str);
}

/// In-process lock manager backed by a map of async mutexes
#[derive(Default)]
pub struct KeyLockManager {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

struct HeldLock {
    _guard: OwnedMutexGuard<()>,
}

impl KeyLock for HeldLock {}

#[async_trait]
impl LockManager for KeyLockManager {
    async fn acquire(&self, key: &str) -> Box<dyn KeyLock> {
        // Clone the Arc out so the map shard is not held across the await
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        Box::new(HeldLock { _guard: guard })
    }

    fn remove(&self, key: &str) {
        self.locks.remove(key);
    }
}
