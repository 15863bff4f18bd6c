//! Redis cache and lease implementation

use async_trait::async_trait;
use fleet_core::{
    config::CacheConfig,
    errors::{FleetError, Result},
    traits::{CacheService, LeaseService},
};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// 只删除仍由当前持有者持有的租约
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis 缓存与分布式租约管理器
#[derive(Clone)]
pub struct RedisCacheManager {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCacheManager {
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        info!("连接Redis: {}", config.redis_url);

        let client = redis::Client::open(config.redis_url.clone())
            .map_err(|e| FleetError::Cache(e.to_string()))?;

        let connect = client.get_connection_manager();
        let mut connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| FleetError::Cache("连接Redis超时".to_string()))?
        .map_err(|e| FleetError::Cache(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| FleetError::Cache(e.to_string()))?;

        info!("Redis连接成功");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Build full cache key with prefix
    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection.clone();
        let result: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| FleetError::Cache(e.to_string()))?;
        Ok(result == "PONG")
    }
}

#[async_trait]
impl CacheService for RedisCacheManager {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let result: Option<String> = redis::cmd("GET")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Cache GET failed for key {}: {}", full_key, e);
                FleetError::Cache(e.to_string())
            })?;

        debug!(
            "Cache {}: {}",
            if result.is_some() { "HIT" } else { "MISS" },
            full_key
        );
        Ok(result)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let ttl_seconds = ttl.as_secs().max(1);
        let _: () = redis::cmd("SETEX")
            .arg(&full_key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Cache SET failed for key {}: {}", full_key, e);
                FleetError::Cache(e.to_string())
            })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let result: i32 = redis::cmd("DEL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Cache DELETE failed for key {}: {}", full_key, e);
                FleetError::Cache(e.to_string())
            })?;

        Ok(result > 0)
    }
}

#[async_trait]
impl LeaseService for RedisCacheManager {
    #[instrument(skip(self))]
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let ttl_ms = ttl.as_millis().max(1) as u64;
        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Lease SET NX failed for key {}: {}", full_key, e);
                FleetError::Cache(e.to_string())
            })?;

        let acquired = result.is_some();
        debug!("租约 {} 获取{}", full_key, if acquired { "成功" } else { "失败" });
        Ok(acquired)
    }

    #[instrument(skip(self))]
    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&full_key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Lease release failed for key {}: {}", full_key, e);
                FleetError::Cache(e.to_string())
            })?;

        Ok(deleted > 0)
    }
}
