//! Redis storage: connection pool wrapper and key layout used by
//! [`RedisBroker`](crate::broker::RedisBroker).

pub mod keys;
pub mod redis;

pub use keys::QueueKeys;
pub use redis::{RedisClient, RedisConfig};
