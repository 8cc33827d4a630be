//! Time-windowed pool of session tags
//!
//! Entries older than the pool lifetime are logically absent even before
//! they are physically purged. Every read takes the monotonic `now` it should
//! be evaluated at.

use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    created: Instant,
}

/// Pool of single-use keys with creation timestamps.
///
/// Entries live in a dense vector (for uniform random picks) with a hash
/// index on the key (for lookup and removal). Removal is `swap_remove`.
#[derive(Debug)]
pub struct TagPool<K, V> {
    entries: Vec<Entry<K, V>>,
    index: HashMap<K, usize>,
    lifetime: Duration,
}

impl<K: Copy + Eq + Hash, V> TagPool<K, V> {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn is_live(&self, created: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created) <= self.lifetime
    }

    /// Insert `key` created at `created`. An existing entry is replaced.
    pub fn insert(&mut self, key: K, value: V, created: Instant) {
        let entry = Entry {
            key,
            value,
            created,
        };
        match self.index.get(&key) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    fn remove_at(&mut self, i: usize) -> Entry<K, V> {
        let entry = self.entries.swap_remove(i);
        self.index.remove(&entry.key);
        if let Some(moved) = self.entries.get(i) {
            self.index.insert(moved.key, i);
        }
        entry
    }

    /// Remove `key`, returning its value if it was still live.
    pub fn remove(&mut self, key: &K, now: Instant) -> Option<V> {
        let i = *self.index.get(key)?;
        let entry = self.remove_at(i);
        self.is_live(entry.created, now).then_some(entry.value)
    }

    /// Remove and return a uniformly chosen live entry.
    ///
    /// Stale entries hit along the way are dropped, so the cost is O(1)
    /// amortized.
    pub fn pick_random(&mut self, now: Instant) -> Option<(K, V)> {
        let mut rng = rand::thread_rng();
        while !self.entries.is_empty() {
            let i = rng.gen_range(0..self.entries.len());
            let entry = self.remove_at(i);
            if self.is_live(entry.created, now) {
                return Some((entry.key, entry.value));
            }
        }
        None
    }

    /// Whether `key` is present and live
    pub fn contains(&self, key: &K, now: Instant) -> bool {
        self.index
            .get(key)
            .is_some_and(|&i| self.is_live(self.entries[i].created, now))
    }

    /// Number of live entries
    pub fn count(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|e| self.is_live(e.created, now))
            .count()
    }

    /// Physically drop stale entries. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let lifetime = self.lifetime;
        self.entries
            .retain(|e| now.saturating_duration_since(e.created) <= lifetime);
        if self.entries.len() != before {
            self.index.clear();
            for (i, e) in self.entries.iter().enumerate() {
                self.index.insert(e.key, i);
            }
        }
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Physical size, stale entries included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
