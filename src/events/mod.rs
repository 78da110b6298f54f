//! Events Module
//!
//! Lifecycle events emitted by the engine, the in-process bus that
//! dispatches them, and the propagator that streams invalidations to
//! external subscribers.

mod bus;
mod propagator;

use serde::Serialize;

pub use bus::{EventBus, Listener, ListenerId};
pub use propagator::{
    InvalidationPropagator, Notification, SubscriptionFilter, SubscriptionHandle,
};

// == Event Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hit,
    Miss,
    Set,
    Invalidate,
    Error,
}

// == Invalidation ==
/// What caused a key to be invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InvalidationTrigger {
    /// Direct single-key invalidation
    Key,
    /// Explicit delete without cascading
    Delete,
    /// `invalidate_by_tag` with this tag
    Tag(String),
    /// `invalidate_by_pattern` with this glob
    Pattern(String),
    /// Dependent of the given key
    Cascade(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invalidation {
    /// Full key that was removed
    pub key: String,
    /// Tags the entry carried
    pub tags: Vec<String>,
    pub trigger: InvalidationTrigger,
}

// == Cache Event ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEvent {
    Hit { key: String, stale: bool },
    Miss { key: String },
    Set { key: String, tags: Vec<String> },
    Invalidate(Invalidation),
    Error { key: Option<String>, message: String },
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::Hit { .. } => EventKind::Hit,
            CacheEvent::Miss { .. } => EventKind::Miss,
            CacheEvent::Set { .. } => EventKind::Set,
            CacheEvent::Invalidate(_) => EventKind::Invalidate,
            CacheEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key }
            | CacheEvent::Set { key, .. } => Some(key),
            CacheEvent::Invalidate(invalidation) => Some(&invalidation.key),
            CacheEvent::Error { key, .. } => key.as_deref(),
        }
    }
}
