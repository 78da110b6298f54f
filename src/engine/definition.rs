//! Cache Definitions
//!
//! A definition is the typed entry point to a cache: it turns arguments
//! into keys, knows how to fetch a missing value and carries the expiry
//! policy for everything it writes. Options are validated once, when the
//! definition is registered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::Cache;
use crate::cache::{CacheEntry, Lookup};
use crate::config::KEY_DELIMITER;
use crate::error::{CacheError, Result};
use crate::events::CacheEvent;
use crate::flight::SingleFlight;
use crate::invalidation::InvalidationReport;

type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;
type FetchFn<A, V> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;
type ListFn<A, V> = Arc<dyn Fn(&A, &V) -> Vec<String> + Send + Sync>;

// == Ttl ==
/// How long a freshly written entry stays fresh.
pub enum Ttl<A, V> {
    Static(Duration),
    /// Computed from the arguments and the value being written
    Dynamic(Arc<dyn Fn(&A, &V) -> Duration + Send + Sync>),
}

impl<A, V> Clone for Ttl<A, V> {
    fn clone(&self) -> Self {
        match self {
            Ttl::Static(ttl) => Ttl::Static(*ttl),
            Ttl::Dynamic(f) => Ttl::Dynamic(Arc::clone(f)),
        }
    }
}

impl<A, V> std::fmt::Debug for Ttl<A, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ttl::Static(ttl) => f.debug_tuple("Static").field(ttl).finish(),
            Ttl::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

// == Builder ==
/// Collects definition options; [`build`](Self::build) validates and registers them.
pub struct DefinitionBuilder<A, V> {
    cache: Cache,
    name: String,
    key_fn: Option<KeyFn<A>>,
    fetch: Option<FetchFn<A, V>>,
    ttl: Option<Ttl<A, V>>,
    stale_while_revalidate: Option<Duration>,
    sliding_window: bool,
    tags_fn: Option<ListFn<A, V>>,
    cascade_fn: Option<ListFn<A, V>>,
    dedupe: bool,
}

impl<A, V> DefinitionBuilder<A, V>
where
    A: Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(cache: Cache, name: &str) -> Self {
        Self {
            cache,
            name: name.to_string(),
            key_fn: None,
            fetch: None,
            ttl: None,
            stale_while_revalidate: None,
            sliding_window: false,
            tags_fn: None,
            cascade_fn: None,
            dedupe: true,
        }
    }

    /// Maps arguments to the raw key; the full key is `namespace:name:raw`.
    pub fn key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Data source used to populate a miss.
    pub fn fetch<F, Fut>(mut self, fetch: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.fetch = Some(Arc::new(move |args| Box::pin(fetch(args))));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(Ttl::Static(ttl));
        self
    }

    pub fn ttl_with<F>(mut self, ttl_fn: F) -> Self
    where
        F: Fn(&A, &V) -> Duration + Send + Sync + 'static,
    {
        self.ttl = Some(Ttl::Dynamic(Arc::new(ttl_fn)));
        self
    }

    /// Serve expired entries for this long while a background fetch refreshes them.
    pub fn stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    /// Restart the TTL on every successful read.
    pub fn sliding_window(mut self, enabled: bool) -> Self {
        self.sliding_window = enabled;
        self
    }

    pub fn tags<F>(mut self, tags_fn: F) -> Self
    where
        F: Fn(&A, &V) -> Vec<String> + Send + Sync + 'static,
    {
        self.tags_fn = Some(Arc::new(tags_fn));
        self
    }

    /// Full keys invalidated together with an entry, computed when it is written.
    pub fn cascade<F>(mut self, cascade_fn: F) -> Self
    where
        F: Fn(&A, &V) -> Vec<String> + Send + Sync + 'static,
    {
        self.cascade_fn = Some(Arc::new(cascade_fn));
        self
    }

    /// When disabled, every caller runs its own fetch.
    pub fn dedupe(mut self, enabled: bool) -> Self {
        self.dedupe = enabled;
        self
    }

    pub fn build(self) -> Result<CacheDefinition<A, V>> {
        let invalid = |reason: &str| {
            Err(CacheError::InvalidDefinition(format!(
                "'{}': {}",
                self.name, reason
            )))
        };

        if self.name.is_empty()
            || self.name.contains(KEY_DELIMITER)
            || self.name.chars().any(char::is_whitespace)
        {
            return invalid("name must be non-empty without whitespace or ':'");
        }
        let Some(key_fn) = self.key_fn.clone() else {
            return invalid("a key function is required");
        };
        if self.sliding_window && self.ttl.is_none() {
            return invalid("sliding window requires an explicit ttl");
        }
        if matches!(self.ttl, Some(Ttl::Static(ttl)) if ttl.is_zero()) {
            return invalid("ttl must be greater than zero");
        }
        if self.stale_while_revalidate.is_some_and(|window| window.is_zero()) {
            return invalid("stale-while-revalidate window must be greater than zero");
        }
        self.cache.engine.ensure_open()?;

        if !self.cache.engine.definitions.lock().insert(self.name.clone()) {
            return Err(CacheError::DuplicateDefinition(self.name));
        }
        debug!(definition = %self.name, "definition registered");

        let prefix = self.cache.full_key(&self.name, "");
        Ok(CacheDefinition {
            inner: Arc::new(DefinitionInner {
                cache: self.cache,
                name: self.name,
                prefix,
                key_fn,
                fetch: self.fetch,
                ttl: self.ttl,
                stale_while_revalidate: self.stale_while_revalidate,
                sliding_window: self.sliding_window,
                tags_fn: self.tags_fn,
                cascade_fn: self.cascade_fn,
                dedupe: self.dedupe,
                flight: SingleFlight::new(),
            }),
        })
    }
}

// == Definition ==
/// Typed handle for one family of keys. Cloning is cheap.
pub struct CacheDefinition<A, V> {
    inner: Arc<DefinitionInner<A, V>>,
}

struct DefinitionInner<A, V> {
    cache: Cache,
    name: String,
    /// `namespace:name:`
    prefix: String,
    key_fn: KeyFn<A>,
    fetch: Option<FetchFn<A, V>>,
    ttl: Option<Ttl<A, V>>,
    stale_while_revalidate: Option<Duration>,
    sliding_window: bool,
    tags_fn: Option<ListFn<A, V>>,
    cascade_fn: Option<ListFn<A, V>>,
    dedupe: bool,
    flight: SingleFlight<V>,
}

impl<A, V> Clone for CacheDefinition<A, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, V> CacheDefinition<A, V>
where
    A: Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Full key for `args`.
    pub fn key(&self, args: &A) -> String {
        format!("{}{}", self.inner.prefix, (self.inner.key_fn)(args))
    }

    // == Get ==
    /// Reads through the tiers, fetching and writing through on a miss.
    ///
    /// Returns `Ok(None)` when nothing is cached and the definition has no
    /// fetch function. Backing-store trouble never fails a read; only a
    /// failed fetch does.
    pub async fn get(&self, args: A) -> Result<Option<V>> {
        let engine = &self.inner.cache.engine;
        engine.ensure_open()?;
        let key = self.key(&args);

        for remote in [false, true] {
            let found = if remote {
                engine.lookup_remote(&key).await
            } else {
                engine.lookup_local(&key)
            };
            let (entry, stale) = match found {
                Lookup::Fresh(entry) => (entry, false),
                Lookup::Stale(entry) if self.inner.stale_while_revalidate.is_some() => (entry, true),
                _ => continue,
            };

            match serde_json::from_str::<V>(&entry.value) {
                Ok(value) => {
                    if stale {
                        self.revalidate(&key, args.clone());
                    } else if self.inner.sliding_window {
                        let ttl = self.inner.ttl_for(&args, &value);
                        engine.touch(&key, &entry, ttl).await;
                    }
                    engine.emit(CacheEvent::Hit { key, stale });
                    return Ok(Some(value));
                }
                Err(e) => engine.evict_corrupt(&key, &e.to_string()).await,
            }
        }

        engine.emit(CacheEvent::Miss { key: key.clone() });
        if self.inner.fetch.is_none() {
            engine.reconcile_missing(&key);
            return Ok(None);
        }

        let value = if self.inner.dedupe {
            let inner = Arc::clone(&self.inner);
            let owned_key = key.clone();
            self.inner
                .flight
                .run(&key, move || DefinitionInner::populate(inner, owned_key, args))
                .await?
        } else {
            DefinitionInner::populate(Arc::clone(&self.inner), key, args).await?
        };
        Ok(Some(value))
    }

    // == Set ==
    /// Writes a value through both tiers with this definition's policy.
    pub async fn set(&self, args: A, value: V) -> Result<()> {
        self.inner.cache.engine.ensure_open()?;
        let key = self.key(&args);
        self.inner.write(&key, &args, &value).await
    }

    /// Removes the entry for `args` without cascading. Returns whether it existed.
    pub async fn delete(&self, args: &A) -> Result<bool> {
        self.inner.cache.delete(&self.key(args)).await
    }

    /// Invalidates the entry for `args` and everything it cascades to.
    pub async fn invalidate(&self, args: &A) -> Result<InvalidationReport> {
        self.inner.cache.invalidate(&self.key(args)).await
    }

    /// Invalidates keys of this definition whose raw part matches `pattern`.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        self.inner
            .cache
            .invalidate_by_pattern(&format!("{}{}{}", self.inner.name, KEY_DELIMITER, pattern))
            .await
    }

    /// Local tier value for `args` if still servable, without events or refresh.
    pub fn peek(&self, args: &A) -> Option<V> {
        let engine = &self.inner.cache.engine;
        let key = self.key(args);
        let now = engine.now();
        let local = engine.local.lock();
        let value = local
            .peek(&key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| serde_json::from_str(&entry.value).ok());
        value
    }

    /// Starts a background refresh unless one is already running for `key`.
    fn revalidate(&self, key: &str, args: A) {
        if self.inner.fetch.is_none() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let started = self
            .inner
            .flight
            .spawn(key, move || DefinitionInner::populate(inner, owned_key, args));
        if started {
            debug!(key = %key, "background revalidation started");
        }
    }
}

impl<A, V> DefinitionInner<A, V>
where
    A: Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn ttl_for(&self, args: &A, value: &V) -> Duration {
        match &self.ttl {
            Some(Ttl::Static(ttl)) => *ttl,
            Some(Ttl::Dynamic(ttl_fn)) => ttl_fn(args, value),
            None => self.cache.config().default_ttl(),
        }
    }

    /// Fetches a value and writes it through. Fetch failures are reported
    /// and returned; nothing is cached for them.
    async fn populate(inner: Arc<Self>, key: String, args: A) -> Result<V> {
        let Some(fetch) = inner.fetch.clone() else {
            return Err(CacheError::FetchFailed(format!(
                "definition '{}' has no fetch function",
                inner.name
            )));
        };

        let value = match fetch(args.clone()).await {
            Ok(value) => value,
            Err(e) => {
                let message = e.to_string();
                warn!(key = %key, error = %message, "fetch failed");
                inner.cache.engine.emit(CacheEvent::Error {
                    key: Some(key),
                    message: format!("fetch failed: {}", message),
                });
                return Err(CacheError::FetchFailed(message));
            }
        };

        inner.write(&key, &args, &value).await?;
        Ok(value)
    }

    async fn write(&self, key: &str, args: &A, value: &V) -> Result<()> {
        let serialized =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let tags = self
            .tags_fn
            .as_ref()
            .map(|tags_fn| tags_fn(args, value))
            .unwrap_or_default();
        let cascade = self
            .cascade_fn
            .as_ref()
            .map(|cascade_fn| cascade_fn(args, value))
            .unwrap_or_default();

        let engine = &self.cache.engine;
        let entry = CacheEntry::new(
            serialized,
            engine.now(),
            self.ttl_for(args, value),
            self.stale_while_revalidate,
        )
        .with_tags(tags)
        .with_cascade(cascade);

        engine.store(key, entry).await;
        Ok(())
    }
}

impl<A, V> std::fmt::Debug for CacheDefinition<A, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDefinition")
            .field("name", &self.inner.name)
            .field("ttl", &self.inner.ttl)
            .field("stale_while_revalidate", &self.inner.stale_while_revalidate)
            .field("sliding_window", &self.inner.sliding_window)
            .field("dedupe", &self.inner.dedupe)
            .finish()
    }
}
