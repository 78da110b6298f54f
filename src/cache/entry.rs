//! Cache Entry Module
//!
//! Defines the envelope stored in both tiers: the serialized value plus its
//! expiry, stale window, tags and cascade keys.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Freshness ==
/// Where an entry sits on its timeline at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now < expires_at`
    Fresh,
    /// `expires_at <= now < stale_until`
    Stale,
    /// Past every deadline
    Expired,
}

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
///
/// Entries are replaced, never edited in place; [`CacheEntry::touched`]
/// builds the successor used by sliding windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The stored value (JSON text)
    pub value: String,
    /// Creation timestamp (Unix milliseconds)
    pub stored_at: u64,
    /// Expiration timestamp (Unix milliseconds)
    pub expires_at: u64,
    /// End of the stale-while-revalidate window; never before `expires_at`
    pub stale_until: Option<u64>,
    /// Tags the entry is registered under
    pub tags: BTreeSet<String>,
    /// Full keys invalidated together with this one
    pub cascade: Vec<String>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry stored at `now_ms` living for `ttl`, optionally
    /// followed by a stale window.
    pub fn new(value: String, now_ms: u64, ttl: Duration, stale_for: Option<Duration>) -> Self {
        let expires_at = now_ms.saturating_add(ttl.as_millis() as u64);
        let stale_until = stale_for.map(|swr| expires_at.saturating_add(swr.as_millis() as u64));

        Self {
            value,
            stored_at: now_ms,
            expires_at,
            stale_until,
            tags: BTreeSet::new(),
            cascade: Vec::new(),
        }
    }

    /// Attaches tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches cascade keys.
    pub fn with_cascade(mut self, cascade: Vec<String>) -> Self {
        self.cascade = cascade;
        self
    }

    // == Freshness ==
    /// Classifies the entry at `now_ms`.
    ///
    /// Boundary condition: an entry is no longer fresh once `now >= expires_at`,
    /// and no longer servable once `now >= stale_until`.
    pub fn freshness(&self, now_ms: u64) -> Freshness {
        if now_ms < self.expires_at {
            Freshness::Fresh
        } else if self.stale_until.is_some_and(|until| now_ms < until) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Returns true once the entry can no longer be served at all.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.freshness(now_ms) == Freshness::Expired
    }

    /// The last instant at which the entry may be served.
    pub fn deadline(&self) -> u64 {
        self.stale_until.unwrap_or(self.expires_at).max(self.expires_at)
    }

    // == Time To Live ==
    /// Remaining lifetime until [`deadline`](Self::deadline), rounded up to whole seconds.
    ///
    /// This is the TTL handed to the backing store, so it is never zero for a
    /// servable entry.
    pub fn store_ttl_secs(&self, now_ms: u64) -> u64 {
        let remaining = self.deadline().saturating_sub(now_ms);
        remaining.div_ceil(1000).max(1)
    }

    /// Returns remaining fresh TTL in milliseconds.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }

    // == Sliding Window ==
    /// Returns a copy whose expiry restarts at `now_ms`, keeping the stale
    /// window length the entry was created with.
    pub fn touched(&self, now_ms: u64, ttl: Duration) -> Self {
        let stale_for = self
            .stale_until
            .map(|until| until.saturating_sub(self.expires_at));
        let expires_at = now_ms.saturating_add(ttl.as_millis() as u64);

        Self {
            expires_at,
            stale_until: stale_for.map(|len| expires_at.saturating_add(len)),
            ..self.clone()
        }
    }
}
