//! Cache Engine
//!
//! [`Cache`] ties the tiers together: the local tier, the breaker-guarded
//! backing store, the tag index, the event bus and the invalidation
//! propagator. Typed access goes through [`CacheDefinition`]s registered on
//! a cache; administrative invalidation goes through the cache itself.

mod definition;

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::cache::{CacheEntry, CacheStats, Freshness, LocalTier, Lookup, StatsRecorder};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{CacheConfig, KEY_DELIMITER};
use crate::error::{CacheError, Result};
use crate::events::{
    CacheEvent, EventBus, Invalidation, InvalidationPropagator, InvalidationTrigger,
    SubscriptionFilter, SubscriptionHandle,
};
use crate::invalidation::{InvalidationReport, KeyPattern, KeyRecord, TagIndex};
use crate::store::{BackingStore, GuardedStore};

pub use definition::{CacheDefinition, DefinitionBuilder, Ttl};

// == Cache ==
/// Shared handle to one cache instance. Cloning is cheap.
#[derive(Clone)]
pub struct Cache {
    engine: Arc<Engine>,
}

struct Engine {
    config: CacheConfig,
    /// `namespace:`
    prefix: String,
    clock: SharedClock,
    local: Mutex<LocalTier>,
    remote: GuardedStore,
    index: TagIndex,
    events: EventBus,
    propagator: Arc<InvalidationPropagator>,
    stats: Arc<StatsRecorder>,
    definitions: Mutex<HashSet<String>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// What a single-key removal found across the tiers and the index.
#[derive(Debug, Default)]
struct Removal {
    existed: bool,
    tags: BTreeSet<String>,
    cascade: Vec<String>,
}

impl Cache {
    /// Builds a cache on the wall clock.
    pub fn new(config: CacheConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Builds a cache on the given clock. Every component shares it.
    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn BackingStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let breaker = CircuitBreaker::new(BreakerConfig::from(&config), clock.clone());
        let remote = GuardedStore::new(store, breaker, config.serializer.build(), clock.clone());
        let local = LocalTier::new(
            config.max_entries,
            Some(Duration::from_secs(config.local_max_age)),
        );

        let events = EventBus::new();
        let stats = Arc::new(StatsRecorder::new());
        let recorder = Arc::clone(&stats);
        events.subscribe(move |event| {
            recorder.record(event);
            Ok(())
        });
        let propagator = Arc::new(InvalidationPropagator::new(
            &config.namespace,
            config.debounce(),
        ));
        propagator.attach(&events);

        let (shutdown, _) = watch::channel(false);
        info!(
            namespace = %config.namespace,
            max_entries = config.max_entries,
            serializer = ?config.serializer,
            "cache initialized"
        );

        Ok(Self {
            engine: Arc::new(Engine {
                prefix: format!("{}{}", config.namespace, KEY_DELIMITER),
                config,
                clock,
                local: Mutex::new(local),
                remote,
                index: TagIndex::new(),
                events,
                propagator,
                stats,
                definitions: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    /// Starts registering a typed definition under `name`.
    pub fn define<A, V>(&self, name: &str) -> DefinitionBuilder<A, V>
    where
        A: Clone + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        DefinitionBuilder::new(self.clone(), name)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.engine.config
    }

    pub fn namespace(&self) -> &str {
        &self.engine.config.namespace
    }

    /// `namespace:definition:raw`
    pub fn full_key(&self, definition: &str, raw: &str) -> String {
        format!(
            "{}{}{}{}",
            self.engine.prefix, definition, KEY_DELIMITER, raw
        )
    }

    /// Prefixes a namespace-relative key with the namespace.
    pub fn qualify(&self, relative: &str) -> String {
        format!("{}{}", self.engine.prefix, relative)
    }

    // == Invalidation ==
    /// Invalidates one full key and everything it cascades to.
    ///
    /// Invalidating an absent key is a no-op.
    pub async fn invalidate(&self, key: &str) -> Result<InvalidationReport> {
        self.engine.ensure_open()?;
        self.engine
            .invalidate_keys(vec![key.to_string()], InvalidationTrigger::Key)
            .await
    }

    /// Invalidates every key carrying `tag`.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<InvalidationReport> {
        self.engine.ensure_open()?;
        let mut keys: BTreeSet<String> = self.engine.index.keys_for_tag(tag).into_iter().collect();
        {
            let local = self.engine.local.lock();
            keys.extend(
                local
                    .keys()
                    .into_iter()
                    .filter(|k| local.peek(k).is_some_and(|e| e.tags.contains(tag))),
            );
        }
        self.engine
            .invalidate_keys(keys.into_iter().collect(), InvalidationTrigger::Tag(tag.to_string()))
            .await
    }

    /// Invalidates every key whose namespace-relative form matches `pattern`.
    ///
    /// The pattern is validated before anything is touched.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        let pattern = KeyPattern::new(pattern)?;
        self.engine.ensure_open()?;
        let keys = self.engine.keys_matching(&pattern).await;
        self.engine
            .invalidate_keys(keys, InvalidationTrigger::Pattern(pattern.as_str().to_string()))
            .await
    }

    /// Removes one full key from both tiers without following its cascade set.
    ///
    /// Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.engine.ensure_open()?;
        let removal = self.engine.remove_key(key, false).await;
        if removal.existed {
            self.engine.emit(CacheEvent::Invalidate(Invalidation {
                key: key.to_string(),
                tags: removal.tags.into_iter().collect(),
                trigger: InvalidationTrigger::Delete,
            }));
        }
        Ok(removal.existed)
    }

    // == Events ==
    /// Opens a filtered, coalesced stream of invalidations.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<SubscriptionHandle> {
        self.engine.ensure_open()?;
        self.engine.propagator.subscribe(filter)
    }

    pub fn events(&self) -> &EventBus {
        &self.engine.events
    }

    pub fn subscriber_count(&self) -> usize {
        self.engine.propagator.subscriber_count()
    }

    // == Monitoring ==
    pub fn stats(&self) -> CacheStats {
        let counts = self.engine.stats.counts();
        let (evictions, local_entries) = {
            let local = self.engine.local.lock();
            (local.evictions(), local.len())
        };

        CacheStats {
            hits: counts.hits,
            stale_hits: counts.stale_hits,
            misses: counts.misses,
            sets: counts.sets,
            invalidations: counts.invalidations,
            errors: counts.errors,
            evictions,
            local_entries,
            indexed_keys: self.engine.index.len(),
            breaker: self.engine.remote.breaker_state(),
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.engine.remote.breaker_state()
    }

    // == Maintenance ==
    /// Drops expired local entries and dead index mappings.
    ///
    /// Returns `(local entries removed, index keys forgotten)`.
    pub fn purge_expired(&self) -> (usize, usize) {
        let now = self.engine.clock.now_ms();
        let local = self.engine.local.lock().cleanup_expired(now);
        let indexed = self.engine.index.purge_expired(now);
        (local, indexed)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.engine.shutdown.subscribe()
    }

    /// Stops background tasks and ends every subscription stream.
    ///
    /// Later operations fail with [`CacheError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) {
        if self.engine.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.shutdown.send_replace(true);
        self.engine.propagator.shutdown();
        info!(namespace = %self.engine.config.namespace, "cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.engine.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("namespace", &self.engine.config.namespace)
            .field("remote", &self.engine.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Engine {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn emit(&self, event: CacheEvent) {
        self.events.emit(&event);
    }

    /// Logs a swallowed backing-store failure and reports it on the bus.
    fn report_store_failure(&self, key: Option<&str>, operation: &str, error: &CacheError) {
        match error {
            CacheError::BreakerOpen => {
                debug!(key = ?key, operation, "backing store skipped, breaker open")
            }
            _ => warn!(key = ?key, operation, error = %error, "backing store call failed"),
        }
        self.emit(CacheEvent::Error {
            key: key.map(str::to_string),
            message: format!("{} failed: {}", operation, error),
        });
    }

    // == Read Path ==
    fn lookup_local(&self, key: &str) -> Lookup {
        let now = self.now();
        self.local.lock().lookup(key, now)
    }

    /// Reads the backing store and writes a servable entry back to the local tier.
    async fn lookup_remote(&self, key: &str) -> Lookup {
        let entry = match self.remote.get_entry(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Lookup::Miss,
            Err(CacheError::Serialization(message)) => {
                self.evict_corrupt(key, &message).await;
                return Lookup::Miss;
            }
            Err(e) => {
                self.report_store_failure(Some(key), "get", &e);
                return Lookup::Miss;
            }
        };

        let now = self.now();
        let found = match entry.freshness(now) {
            Freshness::Fresh => Lookup::Fresh(entry.clone()),
            Freshness::Stale => Lookup::Stale(entry.clone()),
            // Store TTLs are rounded up to whole seconds
            Freshness::Expired => return Lookup::Miss,
        };

        debug!(key = %key, "backing store hit, populating local tier");
        self.index.register(key, record_of(&entry));
        let evicted = self.local.lock().set(key, entry, now);
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "local tier full, evicted least recently used entry");
        }
        found
    }

    /// Drops an entry whose bytes cannot be decoded; the read continues as a miss.
    async fn evict_corrupt(&self, key: &str, message: &str) {
        warn!(key = %key, error = %message, "corrupt cache entry evicted");
        self.local.lock().delete(key);
        self.index.remove(key);
        if let Err(e) = self.remote.delete(key).await {
            self.report_store_failure(Some(key), "delete", &e);
        }
        self.emit(CacheEvent::Error {
            key: Some(key.to_string()),
            message: format!("serialization error: {}", message),
        });
    }

    /// Forgets index state for a key neither tier holds any more.
    fn reconcile_missing(&self, key: &str) {
        if self.index.remove(key).is_some() {
            debug!(key = %key, "dropped stale index mapping");
        }
    }

    // == Write Path ==
    /// Writes through both tiers and the index. Backing-store failures are
    /// swallowed: the local tier already holds the value.
    ///
    /// Populations still in flight when the cache closes finish without
    /// writing anything.
    async fn store(&self, key: &str, entry: CacheEntry) {
        if self.closed.load(Ordering::Acquire) {
            debug!(key = %key, "cache closed, write dropped");
            return;
        }
        let now = self.now();
        let evicted = self.local.lock().set(key, entry.clone(), now);
        if let Some(evicted) = evicted {
            debug!(key = %evicted, "local tier full, evicted least recently used entry");
        }
        self.index.register(key, record_of(&entry));

        if let Err(e) = self.remote.put_entry(key, &entry).await {
            self.report_store_failure(Some(key), "set", &e);
        }
        self.emit(CacheEvent::Set {
            key: key.to_string(),
            tags: entry.tags.into_iter().collect(),
        });
    }

    /// Restarts an entry's expiry in both tiers.
    ///
    /// A key that left the local tier since it was read is not written back.
    /// If it leaves while the backing-store write is in flight, the write is
    /// undone so an invalidation is never reversed by a read.
    async fn touch(&self, key: &str, entry: &CacheEntry, ttl: Duration) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let touched = entry.touched(self.now(), ttl);
        if !self.local.lock().replace(key, touched.clone()) {
            debug!(key = %key, "entry gone before sliding touch, skipped");
            return;
        }
        self.index.extend(key, touched.deadline());
        if let Err(e) = self.remote.put_entry(key, &touched).await {
            self.report_store_failure(Some(key), "touch", &e);
            return;
        }

        let current = self.local.lock().peek(key).cloned();
        match current {
            Some(current) if current == touched => {}
            Some(current) => {
                // A newer local write raced the touch; the backing store follows it
                if let Err(e) = self.remote.put_entry(key, &current).await {
                    self.report_store_failure(Some(key), "set", &e);
                }
            }
            None => {
                debug!(key = %key, "entry removed during sliding touch, undoing write");
                if let Err(e) = self.remote.delete(key).await {
                    self.report_store_failure(Some(key), "delete", &e);
                }
            }
        }
    }

    // == Invalidation ==
    /// Removes one key from the local tier, the backing store and the index.
    ///
    /// With `learn_cascade`, the cascade set is recovered from the backing
    /// store when neither the local tier nor the index knows the key.
    async fn remove_key(&self, key: &str, learn_cascade: bool) -> Removal {
        let local = self.local.lock().delete(key);
        let record = self.index.remove(key);

        let remote_entry = if learn_cascade && local.is_none() && record.is_none() {
            match self.remote.get_entry(key).await {
                Ok(entry) => entry,
                Err(CacheError::Serialization(_)) => None,
                Err(e) => {
                    self.report_store_failure(Some(key), "get", &e);
                    None
                }
            }
        } else {
            None
        };

        let remote_existed = match self.remote.delete(key).await {
            Ok(existed) => existed,
            Err(e) => {
                self.report_store_failure(Some(key), "delete", &e);
                false
            }
        };

        let mut removal = Removal {
            existed: local.is_some() || record.is_some() || remote_existed,
            ..Removal::default()
        };
        for (tags, cascade) in local
            .iter()
            .chain(remote_entry.iter())
            .map(|e| (&e.tags, &e.cascade))
            .chain(record.iter().map(|r| (&r.tags, &r.cascade)))
        {
            removal.tags.extend(tags.iter().cloned());
            for dependent in cascade {
                if !removal.cascade.contains(dependent) {
                    removal.cascade.push(dependent.clone());
                }
            }
        }
        removal
    }

    /// Runs the single-key procedure over `roots` and their cascades.
    ///
    /// A visited set bounds the walk: each key is handled at most once per call.
    async fn invalidate_keys(
        &self,
        roots: Vec<String>,
        trigger: InvalidationTrigger,
    ) -> Result<InvalidationReport> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, InvalidationTrigger)> = roots
            .into_iter()
            .map(|key| (key, trigger.clone()))
            .collect();
        let mut report = InvalidationReport::default();

        while let Some((key, cause)) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }

            let removal = self.remove_key(&key, true).await;
            for dependent in removal.cascade {
                if !visited.contains(&dependent) {
                    queue.push_back((dependent, InvalidationTrigger::Cascade(key.clone())));
                }
            }

            if removal.existed {
                debug!(key = %key, trigger = ?cause, "key invalidated");
                report.keys.push(key.clone());
                self.emit(CacheEvent::Invalidate(Invalidation {
                    key,
                    tags: removal.tags.into_iter().collect(),
                    trigger: cause,
                }));
            }
        }

        if !report.is_empty() {
            info!(trigger = ?trigger, count = report.count(), "invalidation complete");
        }
        Ok(report)
    }

    /// Every known full key whose namespace-relative form matches `pattern`:
    /// local tier, index, and a backing-store scan narrowed by the literal prefix.
    async fn keys_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        let mut candidates: BTreeSet<String> = self.local.lock().keys().into_iter().collect();
        candidates.extend(self.index.keys());

        let scan_prefix = format!("{}{}", self.prefix, pattern.literal_prefix());
        match self.remote.scan(&scan_prefix).await {
            Ok(keys) => candidates.extend(keys),
            Err(e) => self.report_store_failure(None, "scan", &e),
        }

        candidates
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&self.prefix)
                    .is_some_and(|relative| pattern.matches(relative))
            })
            .collect()
    }
}

fn record_of(entry: &CacheEntry) -> KeyRecord {
    KeyRecord {
        tags: entry.tags.clone(),
        cascade: entry.cascade.clone(),
        deadline: entry.deadline(),
    }
}
