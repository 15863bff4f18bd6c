use async_trait::async_trait;
use std::time::Duration;

use crate::FleetResult;

/// 缓存服务接口
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> FleetResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()>;

    async fn delete(&self, key: &str) -> FleetResult<bool>;
}

/// 分布式租约
///
/// `try_acquire` 只有在键不存在时才成功（`SET NX PX` 语义），
/// `release` 只删除仍由 `holder` 持有的租约。
#[async_trait]
pub trait LeaseService: Send + Sync {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool>;

    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool>;
}

/// 缓存键
pub struct CacheKeys;

impl CacheKeys {
    pub fn tenant_status(tenant_id: &str) -> String {
        format!("tenant:status:{tenant_id}")
    }

    pub fn activity_debounce(tenant_id: &str) -> String {
        format!("tenant:activity:{tenant_id}")
    }

    pub const PROVISIONING_LEASE: &'static str = "lease:provisioning";
    pub const SLEEP_SWEEP_LEASE: &'static str = "lease:sweep:sleep";
    pub const GRACE_SWEEP_LEASE: &'static str = "lease:sweep:grace";
    pub const HOST_HEALTH_LEASE: &'static str = "lease:sweep:host_health";
}
