//! Optional Redis cache for resolved market-id hashes.
//!
//! Data model:
//!   {prefix}:market_hash:{0x…hash}  → original market id   (TTL: cache.ttl_secs)
//!
//! The cache only short-circuits the `oracle.market_id_lookup` table and the
//! rehash scan. Every failure degrades to a miss.

use crate::config::CacheConfig;
use crate::error::{KeeperError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait MarketIdCache: Send + Sync {
    async fn get(&self, hash: &str) -> Result<Option<String>>;
    async fn put(&self, hash: &str, market_id: &str) -> Result<()>;
}

fn cache_err(e: redis::RedisError) -> KeeperError {
    KeeperError::TransientRpc(format!("redis: {}", e))
}

/// Redis-backed market hash cache.
///
/// Keys are namespaced under a configurable prefix so several deployments
/// can share one Redis.
#[derive(Clone)]
pub struct RedisMarketCache {
    conn: MultiplexedConnection,
    prefix: String,
    ttl_secs: u64,
}

impl RedisMarketCache {
    pub async fn connect(url: &str, prefix: &str, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(url).map_err(cache_err)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(cache_err)?;
        info!(prefix = prefix, "connected to Redis");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            ttl_secs,
        })
    }

    /// Connect when `REDIS_URL` is configured. An unreachable Redis disables
    /// the cache with a warning.
    pub async fn connect_optional(config: &CacheConfig) -> Option<Arc<dyn MarketIdCache>> {
        if config.redis_url.is_empty() {
            debug!("no REDIS_URL configured, market hash cache disabled");
            return None;
        }
        match Self::connect(&config.redis_url, &config.prefix, config.ttl_secs).await {
            Ok(cache) => match cache.ping().await {
                Ok(()) => Some(Arc::new(cache)),
                Err(e) => {
                    warn!(error = %e, "Redis ping failed, continuing without market hash cache");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Redis unavailable, continuing without market hash cache");
                None
            }
        }
    }

    fn key(&self, hash: &str) -> String {
        market_key(&self.prefix, hash)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(cache_err)?;
        debug!(response = %pong, "Redis ping");
        Ok(())
    }
}

fn market_key(prefix: &str, hash: &str) -> String {
    format!("{}:market_hash:{}", prefix, hash.to_lowercase())
}

#[async_trait]
impl MarketIdCache for RedisMarketCache {
    async fn get(&self, hash: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.key(hash)).await.map_err(cache_err)
    }

    async fn put(&self, hash: &str, market_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(hash), market_id, self.ttl_secs)
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_key_is_namespaced_and_lowercase() {
        assert_eq!(market_key("bitredict", "0xABcd"), "bitredict:market_hash:0xabcd");
    }
}
