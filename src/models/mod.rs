//! Request and Response models for the cache server API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies, plus the
//! document stored by the built-in `kv` definition.

pub mod requests;
pub mod responses;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use requests::{KvSetRequest, PatternRequest, SubscribeQuery};
pub use responses::{
    DeleteResponse, ErrorResponse, GetResponse, HealthResponse, InvalidationResponse,
    SetResponse, StatsResponse,
};

/// Value cached under the `kv` definition.
///
/// The write options travel with the value so the definition's TTL, tag and
/// cascade functions can read them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvDocument {
    pub value: serde_json::Value,
    /// TTL in seconds; the cache default applies when absent
    pub ttl: Option<u64>,
    pub tags: Vec<String>,
    /// Full keys invalidated together with this one
    pub cascade: Vec<String>,
}
