//! Per-key monotonic data index counter
//!
//! Works like a `Map<K, i64>` with a simpler surface. The map itself is
//! safe for concurrent access by different keys, but the index for one
//! particular key must only be incremented by one thread at a time - the
//! stream controller already serializes on its own lock.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// Counts a data index upwards per key.
#[derive(Debug, Default)]
pub struct DataIndexCounter<K> {
    inner: RwLock<HashMap<K, i64>>,
}

impl<K: Eq + Hash + Clone> DataIndexCounter<K> {
    pub fn new() -> Self {
        DataIndexCounter {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Last issued value for the key, -1 if never incremented.
    pub fn get(&self, key: &K) -> i64 {
        self.inner.read().get(key).copied().unwrap_or(-1)
    }

    /// Issues the next value for the key and stores it.
    ///
    /// The first increment for an unseen key returns 0.
    pub fn increment(&self, key: &K) -> i64 {
        let mut map = self.inner.write();
        let next = map.get(key).copied().unwrap_or(-1) + 1;
        map.insert(key.clone(), next);
        next
    }
}
