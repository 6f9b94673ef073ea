//! Redis cache and lease-lock store

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::RedisConfig;
use crate::core::{CachePort, LockStore, PipelineResult, StorageError};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis manager backed by a deadpool connection pool
pub struct RedisCache {
    pool: Pool,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl RedisCache {
    pub fn new(config: &RedisConfig) -> PipelineResult<Self> {
        let mut cfg = Config::from_url(config.url.as_str());
        cfg.pool = Some(PoolConfig::new(config.max_connections as usize));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Cache(e.to_string()))?;

        info!(url = %config.url, "Redis pool created");
        Ok(Self {
            pool,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE),
        })
    }

    fn millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl CachePort for RedisCache {
    async fn get<T>(&self, key: &str) -> PipelineResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let mut conn = self.pool.get().await?;
        let cached: Option<String> = conn.get(key).await?;
        match cached {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> PipelineResult<()>
    where
        T: Serialize + Send + Sync,
    {
        let mut conn = self.pool.get().await?;
        let serialized = serde_json::to_string(value)?;
        let _: () = conn.pset_ex(key, serialized, Self::millis(ttl)).await?;

        debug!(key, ttl_ms = Self::millis(ttl), "Cached key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn health_check(&self) -> PipelineResult<()> {
        let mut conn = self.pool.get().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis health check failed: {}", e);
            StorageError::Cache(format!("Health check failed: {}", e))
        })?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(StorageError::Cache("Unexpected PING response".to_string()).into())
        }
    }
}

#[async_trait]
impl LockStore for RedisCache {
    async fn set_if_not_exists(&self, key: &str, value: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PipelineResult<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> PipelineResult<bool> {
        let mut conn = self.pool.get().await?;
        let refreshed: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(Self::millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }
}
