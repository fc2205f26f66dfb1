//! Generic TTL-indexed cache backing the Metadata (C2), Redirect (C3) and
//! Preload caches. Reads treat an expired entry as absent; writes
//! overwrite unconditionally (no coalescing), per spec §4.2.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    map: DashMap<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: DashMap::new(),
        }
    }

    /// Returns the value if present and not expired. An expired entry
    /// found during a read is treated as absent, not evicted here — the
    /// sweeper reclaims it.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.map.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Overwrites unconditionally, resetting the TTL clock.
    pub fn put(&self, key: K, value: V) {
        self.map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every entry whose TTL has elapsed. Called by the
    /// background sweeper once per minute (spec §3 Lifecycle).
    pub fn sweep(&self) {
        self.map.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
