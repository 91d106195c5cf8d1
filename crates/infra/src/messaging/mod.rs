//! Redis-backed queue and notification adapters (feature `redis`).

#[cfg(feature = "redis")]
pub mod redis_pubsub;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubNotifier;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsQueue, RedisStreamsQueueConfig};
