//! Cache Module
//!
//! Local tier building blocks: entries, LRU tracking, TTL-aware storage,
//! envelope serialization and statistics.

mod entry;
mod local;
mod lru;
mod serializer;
mod stats;


// Re-export public types
pub use entry::{CacheEntry, Freshness};
pub use local::{LocalTier, Lookup};
pub use lru::LruTracker;
pub use serializer::{JsonSerializer, PostcardSerializer, Serializer, SerializerKind};
pub use stats::{CacheStats, EventCounts, StatsRecorder};
