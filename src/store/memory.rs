//! In-process backing store.
//!
//! Shared by every `Cache` built from clones of the same `MemoryStore`, which
//! makes it a stand-in for a remote tier in single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{SharedClock, SystemClock};
use crate::error::Result;
use crate::store::BackingStore;

#[derive(Debug)]
struct Stored {
    bytes: Vec<u8>,
    expires_at: u64,
}

/// TTL-honouring map behind an `Arc`; clones share contents.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Stored>>>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .values()
            .filter(|stored| stored.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw write bypassing the engine, for seeding and fault injection.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>, ttl_secs: u64) {
        let expires_at = self.clock.now_ms().saturating_add(ttl_secs * 1000);
        self.entries
            .lock()
            .insert(key.to_string(), Stored { bytes, expires_at });
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|stored| stored.expires_at > now)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at > now => Ok(Some(stored.bytes.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.insert_raw(key, value, ttl_secs);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|stored| stored.expires_at > now))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        entries.retain(|_, stored| stored.expires_at > now);
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
