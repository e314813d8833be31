//! Connection pool and the handful of Redis commands the broker issues
//!
//! Keys and members are plain strings; values crossing the wire as bytes are
//! the msgpack task records. Nothing here blocks server-side, so a pooled
//! connection is never held longer than one round trip.

use crate::{Error, Result};
use fred::{
    interfaces::*,
    prelude::*,
    types::{RedisConfig as FredRedisConfig, ReconnectPolicy},
};
use std::sync::Arc;

/// Default Redis URL
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

const DEFAULT_POOL_SIZE: usize = 10;

/// Where and how wide to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// `redis://` or `rediss://` URL
    pub url: String,
    /// Number of pooled connections
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}

impl RedisConfig {
    /// Configuration for `url` with the default pool size
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Read `REDIS_URL` and `REDIS_POOL_SIZE`, keeping defaults for unset ones
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let config = match std::env::var("REDIS_POOL_SIZE") {
            Ok(raw) => {
                let size = raw.parse().map_err(|e| {
                    Error::Config(format!("invalid REDIS_POOL_SIZE '{}': {}", raw, e))
                })?;
                Self::new(url).with_pool_size(size)
            }
            Err(_) => Self::new(url),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the pool size
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Reject an empty URL or an empty pool
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Config("redis url cannot be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Pooled Redis connection shared by every clone
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<RedisPool>,
}

impl RedisClient {
    /// Open the pool and wait for its connections
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        config.validate()?;

        let pool = RedisPool::new(
            FredRedisConfig::from_url(&config.url)?,
            None,
            None,
            Some(ReconnectPolicy::default()),
            config.pool_size,
        )?;
        pool.init().await?;

        Ok(Self { pool: Arc::new(pool) })
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> Result<String> {
        Ok(self.pool.ping().await?)
    }

    /// Run a Lua script atomically
    ///
    /// Every multi-key move the broker makes goes through a script so a
    /// task id is never left outside all of its queue's structures.
    pub async fn eval(
        &self,
        script: &'static str,
        keys: Vec<String>,
        args: Vec<RedisValue>,
    ) -> Result<RedisValue> {
        let keys: Vec<RedisKey> = keys.into_iter().map(RedisKey::from).collect();
        Ok(self.pool.eval(script, keys, args).await?)
    }

    /// Fetch the bytes under `key`
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<RedisValue> = self.pool.get(RedisKey::from(key)).await?;
        match value {
            None | Some(RedisValue::Null) => Ok(None),
            Some(value) => value
                .as_bytes()
                .map(|bytes| Some(bytes.to_vec()))
                .ok_or_else(|| Error::Serialization(format!("value at {} is not bytes", key))),
        }
    }

    /// Length of the list at `key`
    pub async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self.pool.llen(RedisKey::from(key)).await?)
    }

    /// Members of the sorted set at `key` scored at or below `max_score`
    pub async fn due(&self, key: &str, max_score: i64) -> Result<Vec<String>> {
        let members: Vec<RedisValue> = self
            .pool
            .zrangebyscore(RedisKey::from(key), 0, max_score, false, None)
            .await?;
        Ok(members.into_iter().filter_map(|v| v.as_string()).collect())
    }

    /// Cardinality of the sorted set at `key`
    pub async fn scheduled_len(&self, key: &str) -> Result<u64> {
        Ok(self.pool.zcard(RedisKey::from(key)).await?)
    }

    /// Members of the set at `key`
    pub async fn members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.pool.smembers(RedisKey::from(key)).await?)
    }

    /// Counter `field` of the hash at `key`; missing reads as zero
    pub async fn counter(&self, key: &str, field: &str) -> Result<u64> {
        let value: Option<u64> = self.pool.hget(RedisKey::from(key), RedisKey::from(field)).await?;
        Ok(value.unwrap_or_default())
    }
}
