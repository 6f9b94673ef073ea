//! Database layer - PostgreSQL store and queue, Redis cache and lock

pub mod postgres;
pub mod redis;

pub use self::postgres::{PostgresQueue, PostgresStore};
pub use self::redis::RedisCache;
