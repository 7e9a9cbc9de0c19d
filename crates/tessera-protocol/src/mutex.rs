//! Keyed mutual exclusion
//!
//! A [`KeyedMutex`] hands out one async mutex per key, created on first use.
//! Each owner (transaction layer, relay engine) holds its own registry so
//! unrelated instances never contend on the same lock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-key async mutexes.
///
/// A key's entry lives only while some task holds or waits on its lock.
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive access to one key of a [`KeyedMutex`]
pub struct KeyedMutexGuard<'a> {
    key: String,
    registry: &'a DashMap<String, Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedMutexGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the registry's own handle left: nobody holds or waits
        self.registry
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyedMutex {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return lock.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`. Waiters are served in FIFO order.
    pub async fn lock(&self, key: &str) -> KeyedMutexGuard<'_> {
        let guard = self.handle(key).lock_owned().await;
        KeyedMutexGuard {
            key: key.to_string(),
            registry: &self.locks,
            guard: Some(guard),
        }
    }

    /// Run `task` while holding the lock for `key`
    pub async fn run_exclusive<F, T>(&self, key: &str, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        task.await
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// No key is held or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
