//! Configuration Module
//!
//! Handles loading and validating cache and server configuration from
//! environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::SerializerKind;
use crate::error::{CacheError, Result};

/// Delimiter between the namespace, definition name and raw key.
pub const KEY_DELIMITER: char = ':';

/// Cache engine and server configuration.
///
/// All values can be configured via environment variables with sensible defaults.
/// A `CacheConfig` is handed to [`Cache::new`](crate::Cache::new) once and is not
/// modified afterwards.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of every key written by this cache
    pub namespace: String,
    /// Maximum number of entries held by the local tier
    pub max_entries: usize,
    /// TTL in seconds for definitions that do not declare one
    pub default_ttl: u64,
    /// Upper bound in seconds on how long the local tier keeps a copy (0 = entry TTL only)
    pub local_max_age: u64,
    /// Consecutive backing-store failures that open the breaker
    pub breaker_threshold: u32,
    /// How long the breaker stays open before probing, in milliseconds
    pub breaker_timeout_ms: u64,
    /// Trial calls allowed while half-open
    pub half_open_requests: u32,
    /// Per-call backing-store timeout in milliseconds
    pub store_timeout_ms: u64,
    /// Default coalescing window for invalidation subscribers in milliseconds
    pub debounce_ms: u64,
    /// Envelope serializer used for the backing store
    pub serializer: SerializerKind,
    /// HTTP server port
    pub server_port: u16,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Redis connection URL; the in-process store is used when unset
    pub redis_url: Option<String>,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAMESPACE` - Key prefix (default: cache)
    /// - `MAX_ENTRIES` - Local tier capacity (default: 1000)
    /// - `DEFAULT_TTL` - Default TTL in seconds (default: 300)
    /// - `LOCAL_MAX_AGE` - Local copy lifetime cap in seconds (default: 0)
    /// - `BREAKER_THRESHOLD` - Failures before opening (default: 5)
    /// - `BREAKER_TIMEOUT_MS` - Open duration (default: 30000)
    /// - `BREAKER_HALF_OPEN_REQUESTS` - Trial calls (default: 1)
    /// - `STORE_TIMEOUT_MS` - Backing store call timeout (default: 1000)
    /// - `DEBOUNCE_MS` - Subscriber coalescing window (default: 100)
    /// - `CACHE_SERIALIZER` - `json` or `postcard` (default: json)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 1)
    /// - `REDIS_URL` - Remote tier URL (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: env::var("CACHE_NAMESPACE").unwrap_or(defaults.namespace),
            max_entries: env_or("MAX_ENTRIES", defaults.max_entries),
            default_ttl: env_or("DEFAULT_TTL", defaults.default_ttl),
            local_max_age: env_or("LOCAL_MAX_AGE", defaults.local_max_age),
            breaker_threshold: env_or("BREAKER_THRESHOLD", defaults.breaker_threshold),
            breaker_timeout_ms: env_or("BREAKER_TIMEOUT_MS", defaults.breaker_timeout_ms),
            half_open_requests: env_or("BREAKER_HALF_OPEN_REQUESTS", defaults.half_open_requests),
            store_timeout_ms: env_or("STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            debounce_ms: env_or("DEBOUNCE_MS", defaults.debounce_ms),
            serializer: env_or("CACHE_SERIALIZER", defaults.serializer),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(KEY_DELIMITER) {
            return Err(CacheError::InvalidRequest(format!(
                "namespace must be non-empty and must not contain '{}'",
                KEY_DELIMITER
            )));
        }
        if self.max_entries == 0 {
            return Err(CacheError::InvalidRequest(
                "max_entries must be at least 1".to_string(),
            ));
        }
        if self.default_ttl == 0 {
            return Err(CacheError::InvalidRequest(
                "default_ttl must be at least 1 second".to_string(),
            ));
        }
        if self.breaker_threshold == 0 || self.half_open_requests == 0 {
            return Err(CacheError::InvalidRequest(
                "breaker threshold and half-open requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "cache".to_string(),
            max_entries: 1000,
            default_ttl: 300,
            local_max_age: 0,
            breaker_threshold: 5,
            breaker_timeout_ms: 30_000,
            half_open_requests: 1,
            store_timeout_ms: 1_000,
            debounce_ms: 100,
            serializer: SerializerKind::Json,
            server_port: 3000,
            cleanup_interval: 1,
            redis_url: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
