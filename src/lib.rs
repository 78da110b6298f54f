//! Tiered Cache - A two-tier cache engine with live invalidation
//!
//! A bounded in-process tier sits in front of a shared backing store guarded
//! by a circuit breaker. Typed definitions add single-flight population,
//! stale-while-revalidate and sliding windows; tags, glob patterns and
//! cascades drive group invalidation, which is streamed to subscribers.

pub mod api;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod flight;
pub mod invalidation;
pub mod models;
pub mod store;
pub mod tasks;

pub use api::AppState;
pub use breaker::CircuitState;
pub use config::CacheConfig;
pub use engine::{Cache, CacheDefinition, DefinitionBuilder, Ttl};
pub use error::{CacheError, Result};
pub use events::{CacheEvent, Notification, SubscriptionFilter, SubscriptionHandle};
pub use invalidation::InvalidationReport;
pub use store::{BackingStore, MemoryStore};
pub use tasks::spawn_cleanup_task;
