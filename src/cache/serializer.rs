//! Serializer Module
//!
//! Encodes cache entry envelopes for the backing store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cache::CacheEntry;
use crate::error::{CacheError, Result};

// == Serializer Trait ==
/// Converts entries to and from their stored byte representation.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<CacheEntry>;
}

/// JSON envelopes, readable with any Redis client.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        serde_json::to_vec(entry).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheEntry> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Compact binary envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn name(&self) -> &'static str {
        "postcard"
    }

    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        postcard::to_stdvec(entry).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CacheEntry> {
        postcard::from_bytes(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

// == Serializer Kind ==
/// Configurable choice of serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    #[default]
    Json,
    Postcard,
}

impl SerializerKind {
    pub fn build(self) -> Arc<dyn Serializer> {
        match self {
            SerializerKind::Json => Arc::new(JsonSerializer),
            SerializerKind::Postcard => Arc::new(PostcardSerializer),
        }
    }
}

impl FromStr for SerializerKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SerializerKind::Json),
            "postcard" => Ok(SerializerKind::Postcard),
            other => Err(CacheError::InvalidRequest(format!(
                "unknown serializer '{}'",
                other
            ))),
        }
    }
}
