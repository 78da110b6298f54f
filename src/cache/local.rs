//! Local Tier Module
//!
//! Bounded in-process map combining LRU eviction with per-entry expiry.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::{CacheEntry, Freshness, LruTracker};

// == Lookup ==
/// Result of a local tier read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Entry is within its TTL
    Fresh(CacheEntry),
    /// Entry is past its TTL but inside its stale window
    Stale(CacheEntry),
    /// Absent, expired, or older than the local copy limit
    Miss,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    inserted_at: u64,
}

// == Local Tier ==
/// In-memory tier with LRU eviction and TTL support.
///
/// Capacity eviction and expiry are independent: an entry may leave because
/// the tier is full, because it expired, or because the local copy outlived
/// `max_age`, whichever comes first.
#[derive(Debug)]
pub struct LocalTier {
    /// Key-entry storage
    slots: HashMap<String, Slot>,
    /// LRU access tracker
    lru: LruTracker,
    /// Maximum number of entries allowed
    max_entries: usize,
    /// Maximum lifetime of a local copy in milliseconds
    max_age_ms: Option<u64>,
    /// Entries removed because the tier was full
    evictions: u64,
}

impl LocalTier {
    // == Constructor ==
    /// Creates a new LocalTier with the given capacity and optional copy age limit.
    pub fn new(max_entries: usize, max_age: Option<Duration>) -> Self {
        Self {
            slots: HashMap::new(),
            lru: LruTracker::new(),
            max_entries: max_entries.max(1),
            max_age_ms: max_age
                .filter(|age| !age.is_zero())
                .map(|age| age.as_millis() as u64),
            evictions: 0,
        }
    }

    // == Lookup ==
    /// Reads a key at `now_ms`, distinguishing fresh from stale entries.
    ///
    /// Entries that can no longer be served are dropped on the way.
    pub fn lookup(&mut self, key: &str, now_ms: u64) -> Lookup {
        let Some(slot) = self.slots.get(key) else {
            return Lookup::Miss;
        };

        let too_old = self
            .max_age_ms
            .is_some_and(|age| now_ms >= slot.inserted_at.saturating_add(age));

        let result = match slot.entry.freshness(now_ms) {
            _ if too_old => None,
            Freshness::Fresh => Some(Lookup::Fresh(slot.entry.clone())),
            Freshness::Stale => Some(Lookup::Stale(slot.entry.clone())),
            Freshness::Expired => None,
        };

        match result {
            Some(found) => {
                self.lru.touch(key);
                found
            }
            None => {
                self.remove_slot(key);
                Lookup::Miss
            }
        }
    }

    // == Get ==
    /// Returns the entry only when it is fresh.
    pub fn get(&mut self, key: &str, now_ms: u64) -> Option<CacheEntry> {
        match self.lookup(key, now_ms) {
            Lookup::Fresh(entry) => Some(entry),
            _ => None,
        }
    }

    // == Set ==
    /// Stores an entry, overwriting any previous one for the key.
    ///
    /// If the tier is at capacity, the least recently used entry is evicted
    /// and its key returned.
    pub fn set(&mut self, key: &str, entry: CacheEntry, now_ms: u64) -> Option<String> {
        let mut evicted = None;

        if !self.slots.contains_key(key) && self.slots.len() >= self.max_entries {
            if let Some(oldest) = self.lru.evict_oldest() {
                self.slots.remove(&oldest);
                self.evictions += 1;
                evicted = Some(oldest);
            }
        }

        self.slots.insert(
            key.to_string(),
            Slot {
                entry,
                inserted_at: now_ms,
            },
        );
        self.lru.touch(key);

        evicted
    }

    /// Replaces the entry of a key that is still present, keeping its local age.
    ///
    /// Returns false when the key is gone, in which case nothing is written.
    pub fn replace(&mut self, key: &str, entry: CacheEntry) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.entry = entry;
                true
            }
            None => false,
        }
    }

    // == Delete ==
    /// Removes an entry by key, returning it when present.
    pub fn delete(&mut self, key: &str) -> Option<CacheEntry> {
        self.remove_slot(key)
    }

    /// Removes every entry whose key matches the predicate.
    pub fn delete_matching<F>(&mut self, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(key, slot)| predicate(key, &slot.entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.remove_slot(key);
        }
        doomed
    }

    /// Reads an entry regardless of expiry, without touching LRU order.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Snapshot of all keys currently held.
    pub fn keys(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    // == Cleanup Expired ==
    /// Removes all entries that can no longer be served.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&mut self, now_ms: u64) -> usize {
        let max_age = self.max_age_ms;
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.entry.is_expired(now_ms)
                    || max_age.is_some_and(|age| now_ms >= slot.inserted_at.saturating_add(age))
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.remove_slot(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn remove_slot(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(key);
        Some(slot.entry)
    }
}
