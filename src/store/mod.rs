//! Backing Store Module
//!
//! Adapters for the remote, shared tier. The engine only needs GET, SET with
//! a TTL, DELETE and a prefix SCAN; the store's own protocol is its business.

use async_trait::async_trait;

use crate::error::Result;

mod guarded;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use guarded::GuardedStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

// == Backing Store Trait ==
/// A remote, TTL-capable key/value store shared between processes.
///
/// Implementations report I/O trouble as
/// [`CacheError::BackingStoreUnavailable`](crate::CacheError::BackingStoreUnavailable)
/// so the circuit breaker can count it.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// Deletes a key, returning whether it was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}
