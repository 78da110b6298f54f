//! In-process event bus.
//!
//! Dispatch is synchronous and follows registration order. Each listener
//! runs behind its own error boundary: a listener that returns an error or
//! panics is logged and skipped, and the remaining listeners still run.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::{CacheEvent, EventKind};

/// Callback invoked for every matching event.
pub type Listener = Arc<dyn Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kinds: Option<HashSet<EventKind>>,
    listener: Listener,
}

impl Registration {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

// == Event Bus ==
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for every event kind.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Registers a listener for the given event kinds only.
    pub fn subscribe_to<F>(&self, kinds: &[EventKind], listener: F) -> ListenerId
    where
        F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(kinds.iter().copied().collect()), Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Dispatches an event, returning how many listeners handled it cleanly.
    pub fn emit(&self, event: &CacheEvent) -> usize {
        // Snapshot so listeners may (un)subscribe from inside a callback
        let snapshot: Vec<Arc<Registration>> = self.listeners.read().clone();
        let kind = event.kind();
        let mut delivered = 0;

        for registration in snapshot.iter().filter(|r| r.wants(kind)) {
            match catch_unwind(AssertUnwindSafe(|| (registration.listener)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(listener = registration.id.0, kind = ?kind, error = %e, "event listener failed");
                }
                Err(_) => {
                    warn!(listener = registration.id.0, kind = ?kind, "event listener panicked");
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn register(&self, kinds: Option<HashSet<EventKind>>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Arc::new(Registration {
            id,
            kinds,
            listener,
        }));
        id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
