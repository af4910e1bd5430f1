//! Per-key asynchronous mutual exclusion

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Set of asynchronous locks, one per key
///
/// Tasks working on different keys never wait for each other, while tasks
/// working on the same key are serialized. Lock entries are dropped once no
/// task holds or waits for them, including when a task stops waiting because
/// its future was dropped, so the table only grows with the number of keys
/// that are being worked on concurrently.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    /// Lock associated with each key that is currently in use
    locks: Mutex<HashMap<K, LockEntry>>,
}
//
impl<K: Clone + Eq + Hash> KeyedLocks<K> {
    /// Set up an empty lock table
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the lock associated with `key` is free, then take it
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let (lock, user) = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = locks.entry(key.clone()).or_default();
            entry.users += 1;
            (entry.lock.clone(), LockUser { table: self, key })
        };
        // If this future is dropped here, dropping `user` unregisters us
        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _user: user,
        }
    }

    /// Truth that some task currently holds or waits for the lock of `key`
    #[cfg(test)]
    pub fn is_locked(&self, key: &K) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.contains_key(key)
    }
}
//
impl<K: Clone + Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock of a single key, along with the number of tasks that use it
#[derive(Debug, Default)]
struct LockEntry {
    /// Underlying lock
    lock: Arc<AsyncMutex<()>>,

    /// Number of tasks that hold or wait for the lock
    users: usize,
}

/// Registration of a task as a user of some key's lock
///
/// The lock entry is removed from the table when its last user goes away.
struct LockUser<'table, K: Clone + Eq + Hash> {
    /// Table that the lock comes from
    table: &'table KeyedLocks<K>,

    /// Key whose lock is used
    key: K,
}
//
impl<K: Clone + Eq + Hash> Drop for LockUser<'_, K> {
    fn drop(&mut self) {
        let mut locks = self.table.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get_mut(&self.key) {
            entry.users -= 1;
            if entry.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Proof that the lock of some key is held, released on drop
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'table, K: Clone + Eq + Hash> {
    /// Underlying lock guard
    ///
    /// Fields are dropped in order, so the lock is released before the user
    /// is unregistered.
    _guard: OwnedMutexGuard<()>,

    /// Registration as a user of the lock
    _user: LockUser<'table, K>,
}
