//! Invalidation Propagator
//!
//! Re-publishes `invalidate` events from the bus to external subscribers.
//! Every subscriber owns a filter and a task that reads from a shared
//! broadcast channel, keeps the matching events and coalesces bursts into a
//! single [`Notification`] per debounce window.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, warn};

use super::{CacheEvent, EventBus, EventKind, Invalidation, InvalidationTrigger, ListenerId};
use crate::config::KEY_DELIMITER;
use crate::error::{CacheError, Result};
use crate::invalidation::KeyPattern;

const BROADCAST_CAPACITY: usize = 1024;
const NOTIFICATION_BUFFER: usize = 64;

type Registry = Arc<Mutex<HashMap<u64, AbortHandle>>>;

// == Filter ==
/// What a subscriber wants to hear about. Criteria are OR-ed together and an
/// empty filter matches every invalidation. Keys and patterns are relative
/// to the cache namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Coalescing window; `None` uses the propagator default, `0` disables batching
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl SubscriptionFilter {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = Some(debounce.as_millis() as u64);
        self
    }
}

/// One coalesced batch delivered to a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Namespace-relative keys that were invalidated
    pub keys: BTreeSet<String>,
    /// Filter tags that matched (every tag involved for an empty filter)
    pub tags: BTreeSet<String>,
    /// Filter patterns that matched (trigger patterns for an empty filter)
    pub patterns: BTreeSet<String>,
    /// Number of invalidation events folded into this batch
    pub events: usize,
}

impl Notification {
    fn merge(&mut self, other: Notification) {
        self.keys.extend(other.keys);
        self.tags.extend(other.tags);
        self.patterns.extend(other.patterns);
        self.events += other.events;
    }
}

struct CompiledFilter {
    prefix: String,
    keys: HashSet<String>,
    tags: HashSet<String>,
    patterns: Vec<KeyPattern>,
}

impl CompiledFilter {
    fn compile(filter: &SubscriptionFilter, prefix: &str) -> Result<Self> {
        let patterns = filter
            .patterns
            .iter()
            .map(|p| KeyPattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        let keys = filter
            .keys
            .iter()
            .map(|k| k.strip_prefix(prefix).unwrap_or(k).to_string())
            .collect();

        Ok(Self {
            prefix: prefix.to_string(),
            keys,
            tags: filter.tags.iter().cloned().collect(),
            patterns,
        })
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.tags.is_empty() && self.patterns.is_empty()
    }

    fn matches(&self, invalidation: &Invalidation) -> Option<Notification> {
        let relative = invalidation
            .key
            .strip_prefix(&self.prefix)
            .unwrap_or(&invalidation.key);

        let mut event_tags: BTreeSet<&str> = invalidation.tags.iter().map(String::as_str).collect();
        let mut trigger_pattern = None;
        match &invalidation.trigger {
            InvalidationTrigger::Tag(tag) => {
                event_tags.insert(tag.as_str());
            }
            InvalidationTrigger::Pattern(pattern) => trigger_pattern = Some(pattern.as_str()),
            _ => {}
        }

        let mut notification = Notification {
            keys: BTreeSet::from([relative.to_string()]),
            events: 1,
            ..Default::default()
        };

        if self.is_empty() {
            notification.tags = event_tags.into_iter().map(str::to_string).collect();
            notification.patterns = trigger_pattern.into_iter().map(str::to_string).collect();
            return Some(notification);
        }

        let key_hit = self.keys.contains(relative);
        notification.tags = event_tags
            .into_iter()
            .filter(|tag| self.tags.contains(*tag))
            .map(str::to_string)
            .collect();
        notification.patterns = self
            .patterns
            .iter()
            .filter(|p| p.matches(relative) || trigger_pattern == Some(p.as_str()))
            .map(|p| p.as_str().to_string())
            .collect();

        if key_hit || !notification.tags.is_empty() || !notification.patterns.is_empty() {
            Some(notification)
        } else {
            None
        }
    }
}

// == Propagator ==
pub struct InvalidationPropagator {
    prefix: String,
    sender: broadcast::Sender<Arc<Invalidation>>,
    subscribers: Registry,
    next_id: AtomicU64,
    default_debounce: Duration,
    closed: AtomicBool,
}

impl InvalidationPropagator {
    pub fn new(namespace: &str, default_debounce: Duration) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            prefix: format!("{}{}", namespace, KEY_DELIMITER),
            sender,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            default_debounce,
            closed: AtomicBool::new(false),
        }
    }

    /// Registers on the bus so every `invalidate` event is forwarded.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> ListenerId {
        let propagator = Arc::clone(self);
        bus.subscribe_to(&[EventKind::Invalidate], move |event| {
            if let CacheEvent::Invalidate(invalidation) = event {
                propagator.publish(invalidation.clone());
            }
            Ok(())
        })
    }

    /// Fans an invalidation out to the live subscribers.
    pub fn publish(&self, invalidation: Invalidation) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        // No receivers is not an error
        self.sender.send(Arc::new(invalidation)).unwrap_or(0)
    }

    /// Starts a subscription. Must be called from within a tokio runtime.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<SubscriptionHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let compiled = CompiledFilter::compile(&filter, &self.prefix)?;
        let debounce = filter
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_debounce);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Subscribe before spawning so nothing published after this call is missed
        let events = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let task = tokio::spawn(run_subscriber(id, events, compiled, debounce, tx));
        self.subscribers.lock().insert(id, task.abort_handle());

        debug!(subscriber = id, debounce_ms = debounce.as_millis() as u64, "subscriber registered");
        Ok(SubscriptionHandle {
            id,
            receiver: rx,
            registry: Arc::clone(&self.subscribers),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Stops every subscriber task; their handles then yield `None`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<AbortHandle> = self.subscribers.lock().drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for InvalidationPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationPropagator")
            .field("prefix", &self.prefix)
            .field("subscribers", &self.subscriber_count())
            .field("default_debounce", &self.default_debounce)
            .finish()
    }
}

async fn next_match(
    id: u64,
    events: &mut broadcast::Receiver<Arc<Invalidation>>,
    filter: &CompiledFilter,
) -> Option<Notification> {
    loop {
        match events.recv().await {
            Ok(invalidation) => {
                if let Some(notification) = filter.matches(&invalidation) {
                    return Some(notification);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subscriber = id, skipped, "subscriber lagged, invalidations dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn run_subscriber(
    id: u64,
    mut events: broadcast::Receiver<Arc<Invalidation>>,
    filter: CompiledFilter,
    debounce: Duration,
    out: mpsc::Sender<Notification>,
) {
    while let Some(mut batch) = next_match(id, &mut events, &filter).await {
        let mut source_closed = false;
        if !debounce.is_zero() {
            let deadline = Instant::now() + debounce;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    next = next_match(id, &mut events, &filter) => match next {
                        Some(more) => batch.merge(more),
                        None => {
                            source_closed = true;
                            break;
                        }
                    },
                }
            }
        }

        if out.send(batch).await.is_err() || source_closed {
            break;
        }
    }
    debug!(subscriber = id, "subscriber stopped");
}

// == Subscription Handle ==
/// Receiving side of a subscription. Dropping it tears the subscription down.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    receiver: mpsc::Receiver<Notification>,
    registry: Registry,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next batch; `None` once the propagator shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.registry.lock().remove(&self.id) {
            task.abort();
        }
    }
}

impl Stream for SubscriptionHandle {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
