//! Keyed async locks whose entries disappear once nobody holds or waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// A table of per-key async mutexes.
///
/// The table map itself is behind a blocking mutex that is never held across
/// an `.await`, so a guard can prune its entry from `Drop`.
pub(crate) struct KeyedLocks<K> {
    map: SyncMutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Holds one key's lock; releasing it prunes the entry when idle.
pub(crate) struct KeyGuard<'a, K: Eq + Hash + Clone> {
    table: &'a KeyedLocks<K>,
    key: K,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            map: SyncMutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let lock = self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            table: self,
            key: key.clone(),
            held: Some(lock.lock_owned().await),
        }
    }

    /// Keys currently held or waited on.
    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // New handles are only cloned under the map lock, so a count of one
        // (the map's own) means no holder and no waiter.
        let mut map = self.table.map.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.held.take());
        if map.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.key);
        }
    }
}
