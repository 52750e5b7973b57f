// src/locks.rs

//! Keyed mutual exclusion.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{FlowError, Result};

/// One lock per key, created on first use and dropped once nobody holds or
/// waits for it.
///
/// Used to serialize attempt creation per session and cursor moves per
/// schedule while unrelated keys proceed concurrently.
#[derive(Debug)]
pub struct LockTable<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with<T>(&self, key: &K, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self.table()?;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(FlowError::infrastructure("keyed lock poisoned")),
        };
        self.release(key, lock);
        result
    }

    /// Number of keys currently holding an entry.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<K, Arc<Mutex<()>>>>> {
        self.locks
            .lock()
            .map_err(|_| FlowError::infrastructure("lock table poisoned"))
    }

    /// Drop the entry for `key` when `lock` and the table hold the only
    /// references. Clones are only taken under the table lock, so the count
    /// cannot grow while it is checked.
    fn release(&self, key: &K, lock: Arc<Mutex<()>>) {
        let Ok(mut locks) = self.table() else {
            return;
        };
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
