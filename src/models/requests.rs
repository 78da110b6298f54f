//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies and query strings.

use std::time::Duration;

use serde::Deserialize;

use crate::events::SubscriptionFilter;

const MAX_KEY_LEN: usize = 256;

/// Request body for the SET operation (PUT /kv)
///
/// # Fields
/// - `key`: Raw key inside the `kv` definition
/// - `value`: Any JSON value
/// - `ttl`: Optional TTL in seconds (uses default if not specified)
/// - `tags`: Tags for group invalidation
/// - `cascade`: Namespace-relative keys invalidated together with this one
#[derive(Debug, Clone, Deserialize)]
pub struct KvSetRequest {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cascade: Vec<String>,
}

impl KvSetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > MAX_KEY_LEN {
            return Some(format!(
                "Key exceeds maximum length of {} characters",
                MAX_KEY_LEN
            ));
        }
        if self.ttl == Some(0) {
            return Some("TTL must be at least 1 second".to_string());
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Some("Tags cannot be empty".to_string());
        }
        None
    }
}

/// Request body for POST /invalidate/pattern
#[derive(Debug, Clone, Deserialize)]
pub struct PatternRequest {
    /// Glob over namespace-relative keys
    pub pattern: String,
}

/// Query string for GET /subscribe; lists are comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    pub keys: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub patterns: Option<String>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

impl SubscribeQuery {
    pub fn into_filter(self) -> SubscriptionFilter {
        let mut filter = SubscriptionFilter::default()
            .with_keys(split_list(self.keys.as_deref()))
            .with_tags(split_list(self.tags.as_deref()))
            .with_patterns(split_list(self.patterns.as_deref()));
        if let Some(ms) = self.debounce_ms {
            filter = filter.with_debounce(Duration::from_millis(ms));
        }
        filter
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
