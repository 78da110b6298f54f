//! Breaker-guarded backing store access.

use std::sync::Arc;

use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::{CacheEntry, Serializer};
use crate::clock::SharedClock;
use crate::error::Result;
use crate::store::BackingStore;

/// Every engine call to the backing store goes through here: the circuit
/// breaker gates it, the per-call timeout bounds it, and entries are
/// (de)serialized on the way.
pub struct GuardedStore {
    store: Arc<dyn BackingStore>,
    breaker: CircuitBreaker,
    serializer: Arc<dyn Serializer>,
    clock: SharedClock,
}

impl GuardedStore {
    pub fn new(
        store: Arc<dyn BackingStore>,
        breaker: CircuitBreaker,
        serializer: Arc<dyn Serializer>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            breaker,
            serializer,
            clock,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Reads and decodes an entry.
    ///
    /// Corrupt bytes surface as a serialization error without counting
    /// against the breaker; the store itself answered fine.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let bytes = self.breaker.call(self.store.get(key)).await?;
        match bytes {
            Some(bytes) => self.serializer.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Encodes and writes an entry with a TTL covering its stale window.
    pub async fn put_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let bytes = self.serializer.encode(entry)?;
        let ttl_secs = entry.store_ttl_secs(self.clock.now_ms());
        debug!(key = %key, ttl_secs, store = self.store.name(), "writing entry to backing store");
        self.breaker.call(self.store.set(key, bytes, ttl_secs)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.breaker.call(self.store.delete(key)).await
    }

    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.breaker.call(self.store.scan(prefix)).await
    }
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("store", &self.store.name())
            .field("breaker", &self.breaker.state())
            .field("serializer", &self.serializer.name())
            .finish()
    }
}
