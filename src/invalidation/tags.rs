//! Tag Index
//!
//! Maps tags to the full keys carrying them, and keeps each key's cascade
//! set so invalidation can follow dependents after the entry itself is gone.
//! The index has its own lock and never touches the tiers.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;

/// What the index knows about one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRecord {
    pub tags: BTreeSet<String>,
    pub cascade: Vec<String>,
    /// Last instant the entry may be served; the mapping is dead afterwards
    pub deadline: u64,
}

#[derive(Debug, Default)]
struct IndexState {
    by_tag: HashMap<String, HashSet<String>>,
    records: HashMap<String, KeyRecord>,
}

impl IndexState {
    fn unlink(&mut self, key: &str) -> Option<KeyRecord> {
        let record = self.records.remove(key)?;
        for tag in &record.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        Some(record)
    }
}

// == Tag Index ==
#[derive(Debug, Default)]
pub struct TagIndex {
    state: RwLock<IndexState>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a key's tags and cascade set, replacing whatever was known before.
    ///
    /// Keys with neither tags nor cascade keys are still recorded so pattern
    /// sweeps can find them.
    pub fn register(&self, key: &str, record: KeyRecord) {
        let mut state = self.state.write();
        state.unlink(key);
        for tag in &record.tags {
            state
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.records.insert(key.to_string(), record);
    }

    /// Forgets a key, removing it from every tag set.
    pub fn remove(&self, key: &str) -> Option<KeyRecord> {
        self.state.write().unlink(key)
    }

    pub fn record(&self, key: &str) -> Option<KeyRecord> {
        self.state.read().records.get(key).cloned()
    }

    /// Moves a key's deadline, e.g. after a sliding-window touch.
    pub fn extend(&self, key: &str, deadline: u64) {
        if let Some(record) = self.state.write().records.get_mut(key) {
            record.deadline = deadline;
        }
    }

    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.state
            .read()
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.read().records.keys().cloned().collect()
    }

    /// Drops mappings whose entries can no longer be alive.
    ///
    /// Returns the number of keys forgotten.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let mut state = self.state.write();
        let dead: Vec<String> = state
            .records
            .iter()
            .filter(|(_, record)| record.deadline <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            state.unlink(key);
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    pub fn tag_count(&self) -> usize {
        self.state.read().by_tag.len()
    }
}
