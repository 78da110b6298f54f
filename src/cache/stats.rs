//! Cache Statistics Module
//!
//! Tracks cache performance metrics by listening to the event bus.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::breaker::CircuitState;
use crate::events::CacheEvent;

// == Cache Stats ==
/// Point-in-time view of cache performance.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Reads answered from either tier (stale reads included)
    pub hits: u64,
    /// Reads answered with a stale value while revalidating
    pub stale_hits: u64,
    /// Reads that found nothing servable in either tier
    pub misses: u64,
    /// Entries written through
    pub sets: u64,
    /// Keys invalidated or deleted
    pub invalidations: u64,
    /// Errors reported on the event bus
    pub errors: u64,
    /// Entries evicted from the local tier due to capacity
    pub evictions: u64,
    /// Current number of entries in the local tier
    pub local_entries: usize,
    /// Keys currently tracked by the tag index
    pub indexed_keys: usize,
    /// Circuit breaker state for the backing store
    pub breaker: CircuitState,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Event-bus listener accumulating counters.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

/// Counters owned by the recorder; the remaining `CacheStats` fields come from the tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single event.
    pub fn record(&self, event: &CacheEvent) {
        let counter = match event {
            CacheEvent::Hit { stale, .. } => {
                if *stale {
                    self.stale_hits.fetch_add(1, Ordering::Relaxed);
                }
                &self.hits
            }
            CacheEvent::Miss { .. } => &self.misses,
            CacheEvent::Set { .. } => &self.sets,
            CacheEvent::Invalidate(_) => &self.invalidations,
            CacheEvent::Error { .. } => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counts(&self) -> EventCounts {
        EventCounts {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
