//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tiered_cache::clock::ManualClock;
use tiered_cache::store::{BackingStore, MemoryStore};
use tiered_cache::{Cache, CacheConfig, CacheError, Result};

/// Memory store that fails every call while `failing` is set and counts the
/// calls that reached it. Writes can be held until released.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    holding: Arc<AtomicBool>,
    held: Arc<AtomicUsize>,
    release: Arc<Notify>,
}

impl FlakyStore {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            holding: Arc::new(AtomicBool::new(false)),
            held: Arc::new(AtomicUsize::new(0)),
            release: Arc::new(Notify::new()),
        }
    }

    /// Parks every following `set` until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    /// Lets one parked write through and stops holding new ones.
    pub fn release_writes(&self) {
        self.holding.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    /// Writes currently parked.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls that reached the store, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::BackingStoreUnavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackingStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.enter()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.enter()?;
        if self.holding.load(Ordering::SeqCst) {
            self.held.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.set(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter()?;
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.enter()?;
        self.inner.scan(prefix).await
    }
}

/// A cache on a manual clock starting at zero, over a flaky store.
pub struct Harness {
    pub cache: Cache,
    pub clock: ManualClock,
    pub store: FlakyStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let clock = ManualClock::new(0);
        let store = FlakyStore::new(&clock);
        let cache = Cache::with_clock(config, Arc::new(store.clone()), Arc::new(clock.clone()))
            .expect("valid config");
        Self {
            cache,
            clock,
            store,
        }
    }

    /// Another cache instance sharing this harness's store and clock.
    pub fn sibling(&self) -> Cache {
        Cache::with_clock(
            CacheConfig::default(),
            Arc::new(self.store.clone()),
            Arc::new(self.clock.clone()),
        )
        .expect("valid config")
    }
}
