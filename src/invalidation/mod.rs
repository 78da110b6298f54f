//! Invalidation Module
//!
//! Group invalidation support: glob patterns over keys and the tag index.

mod pattern;
mod tags;

use serde::Serialize;

pub use pattern::KeyPattern;
pub use tags::{KeyRecord, TagIndex};

/// Keys removed by one invalidation call, cascades included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub keys: Vec<String>,
}

impl InvalidationReport {
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}
