//! Memory Store Module
//!
//! The in-memory tier: entries partitioned by category, with FIFO eviction
//! by creation time.

use std::collections::HashMap;

use crate::cache::CacheEntry;

#[derive(Debug, Clone)]
struct Slot<T> {
    entry: CacheEntry<T>,
    /// Insertion sequence, breaks ties between equal `created_at` values
    seq: u64,
}

// == Memory Store ==
/// Category-partitioned entry storage.
///
/// A key lives in exactly one category; writing it under another category
/// moves it.
#[derive(Debug)]
pub struct MemoryStore<T> {
    /// category -> key -> entry
    partitions: HashMap<String, HashMap<String, Slot<T>>>,
    /// key -> owning category
    owners: HashMap<String, String>,
    next_seq: u64,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            partitions: HashMap::new(),
            owners: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> MemoryStore<T> {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Lookup ==
    /// Returns the entry for `key` in `category` if it is still fresh at `now_ms`.
    pub fn get_fresh(&self, key: &str, category: &str, now_ms: u64) -> Option<&CacheEntry<T>> {
        self.partitions
            .get(category)
            .and_then(|p| p.get(key))
            .map(|slot| &slot.entry)
            .filter(|entry| !entry.is_expired_at(now_ms))
    }

    /// Returns the entry for `key` regardless of category or expiry.
    pub fn get_any(&self, key: &str) -> Option<&CacheEntry<T>> {
        let category = self.owners.get(key)?;
        self.partitions
            .get(category)
            .and_then(|p| p.get(key))
            .map(|slot| &slot.entry)
    }

    // == Insert ==
    /// Stores `entry`, replacing any previous value for `key`.
    pub fn insert(&mut self, key: &str, category: &str, entry: CacheEntry<T>) {
        let moved_from = self
            .owners
            .get(key)
            .filter(|owner| owner.as_str() != category)
            .cloned();
        if let Some(previous) = moved_from {
            self.remove_from_partition(key, &previous);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.partitions
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), Slot { entry, seq });
        self.owners.insert(key.to_string(), category.to_string());
    }

    // == Evict ==
    /// Removes the oldest entries of `category` until at most `max_entries`
    /// remain. Age is `created_at`, so reads do not protect an entry.
    ///
    /// Returns the evicted keys, oldest first.
    pub fn evict_excess(&mut self, category: &str, max_entries: usize) -> Vec<String> {
        let Some(partition) = self.partitions.get_mut(category) else {
            return Vec::new();
        };
        if partition.len() <= max_entries {
            return Vec::new();
        }

        let mut by_age: Vec<(u64, u64, String)> = partition
            .iter()
            .map(|(key, slot)| (slot.entry.created_at, slot.seq, key.clone()))
            .collect();
        by_age.sort_unstable();

        let excess = partition.len() - max_entries;
        let evicted: Vec<String> = by_age
            .into_iter()
            .take(excess)
            .map(|(_, _, key)| key)
            .collect();

        for key in &evicted {
            partition.remove(key);
            self.owners.remove(key);
        }

        evicted
    }

    // == Remove ==
    /// Removes `key` from whichever category holds it.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let category = self.owners.remove(key)?;
        self.partitions
            .get_mut(&category)
            .and_then(|p| p.remove(key))
            .map(|slot| slot.entry)
    }

    /// Removes `key` only if `category` holds it.
    pub fn remove_from(&mut self, key: &str, category: &str) -> Option<CacheEntry<T>> {
        if self.owner(key)? != category {
            return None;
        }
        self.remove(key)
    }

    /// Category currently holding `key`.
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owners.get(key).map(String::as_str)
    }

    /// Removes every key containing `pattern`. Returns the removed keys.
    pub fn remove_matching(&mut self, pattern: &str) -> Vec<String> {
        let matching: Vec<String> = self
            .owners
            .keys()
            .filter(|key| key.contains(pattern))
            .cloned()
            .collect();

        for key in &matching {
            self.remove(key);
        }

        matching
    }

    fn remove_from_partition(&mut self, key: &str, category: &str) {
        if let Some(partition) = self.partitions.get_mut(category) {
            partition.remove(key);
        }
    }

    // == Clear ==
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.owners.clear();
    }

    // == Length ==
    /// Returns the number of entries across all categories.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns the number of entries held for `category`.
    pub fn category_len(&self, category: &str) -> usize {
        self.partitions.get(category).map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
