//! Redis backing store (feature `redis`).

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use crate::error::{CacheError, Result};
use crate::store::BackingStore;

/// Remote tier on a Redis server over a multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!("Connected to Redis backing store");
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::BackingStoreUnavailable(e.to_string())
}

#[async_trait]
impl BackingStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs.max(1))
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter = conn
            .scan_match::<_, String>(format!("{}*", prefix))
            .await
            .map_err(unavailable)?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
