//! 数据仓储层接口定义
//!
//! 所有跨请求的不变量都由存储层的原子条件操作保证：
//! - 容量预订使用行锁 + 条件更新，并发调用不会让 `ram_used_mb` 超过 `ram_total_mb`
//! - 状态转换只在当前状态匹配时生效，返回 `None` 表示其他调用方已经完成
//!
//! 实现必须是 `Send + Sync`，供多个周期任务和请求处理器共享。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    HostRegistration, HostStatus, PlanRamTable, RegisteredHost, StatusTransition, TaskAuditRecord,
    Tenant, TenantStatus, NewTenant, WorkerHost,
};
use crate::FleetResult;

/// 为租户预订容量的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TenantReservation {
    /// 预订成功，租户已进入 provisioning 并绑定到主机
    Assigned { host: WorkerHost, tenant: Tenant },
    /// 没有任何活跃主机有足够余量
    Exhausted,
    /// 租户已不处于 pending（被其他调用方处理或已取消）
    NotPending(TenantStatus),
}

/// 唤醒事务的结果
#[derive(Debug, Clone, PartialEq)]
pub enum WakeReservation {
    /// 本调用赢得 sleeping → active 转换并在原主机上重新预订了内存
    Claimed { host: WorkerHost, tenant: Tenant },
    /// 没有行被修改，租户当前状态如附带值
    NotSleeping(TenantStatus),
    /// 租户所在主机余量不足
    InsufficientCapacity { host_id: String, required_mb: i64 },
}

/// 主机移除结果
#[derive(Debug, Clone, PartialEq)]
pub enum HostRemoval {
    Removed(WorkerHost),
    InUse { assigned: i64 },
    NotFound,
}

/// 主机仓储接口
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// 按地址幂等注册主机，首次注册时 `is_new = true`
    async fn register(&self, registration: &HostRegistration) -> FleetResult<RegisteredHost>;

    async fn get_by_id(&self, host_id: &str) -> FleetResult<Option<WorkerHost>>;

    async fn list(&self) -> FleetResult<Vec<WorkerHost>>;

    /// 原子预订：选择余量足够且预订量最高的活跃主机
    async fn reserve(&self, required_mb: i64) -> FleetResult<Option<WorkerHost>>;

    /// 原子预订并把租户从 pending 转到 provisioning（同一事务）
    async fn reserve_for_tenant(
        &self,
        tenant_id: &str,
        required_mb: i64,
        container_name: &str,
    ) -> FleetResult<TenantReservation>;

    /// 唤醒事务：锁定租户所在主机，条件转换 sleeping → active 并加回套餐内存
    async fn wake_on_assigned_host(
        &self,
        tenant_id: &str,
        required_mb: i64,
    ) -> FleetResult<WakeReservation>;

    /// 锁定主机行后，按预订状态租户的套餐内存重新计算 `ram_used_mb`
    ///
    /// 主机不存在时返回 `None`
    async fn recompute_ram(&self, host_id: &str, plans: &PlanRamTable)
        -> FleetResult<Option<i64>>;

    /// 只读检查：是否存在能接纳指定内存的活跃主机
    async fn has_headroom(&self, required_mb: i64) -> FleetResult<bool>;

    async fn set_status(&self, host_id: &str, status: HostStatus)
        -> FleetResult<Option<WorkerHost>>;

    /// 记录一次探测：刷新 `last_seen_at`，实测内存仅用于诊断
    async fn record_probe(
        &self,
        host_id: &str,
        measured_ram_used_mb: Option<i64>,
        seen_at: DateTime<Utc>,
    ) -> FleetResult<()>;

    /// 条件删除：只有没有未清除租户绑定时才删除
    async fn remove_if_unassigned(&self, host_id: &str) -> FleetResult<HostRemoval>;
}

/// 租户仓储接口
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create(&self, tenant: &NewTenant) -> FleetResult<Tenant>;

    async fn get_by_id(&self, tenant_id: &str) -> FleetResult<Option<Tenant>>;

    /// 条件状态转换，没有行被修改时返回 `None`
    async fn transition(&self, transition: &StatusTransition) -> FleetResult<Option<Tenant>>;

    async fn list_by_status(&self, statuses: &[TenantStatus]) -> FleetResult<Vec<Tenant>>;

    async fn count_by_status(&self, status: TenantStatus) -> FleetResult<i64>;

    /// 处于指定状态且 `updated_at` 早于给定时间的租户
    async fn list_stalled(
        &self,
        statuses: &[TenantStatus],
        updated_before: DateTime<Utc>,
    ) -> FleetResult<Vec<Tenant>>;

    /// 更新最近活跃时间，租户不存在时返回 false
    async fn touch_activity(&self, tenant_id: &str, at: DateTime<Utc>) -> FleetResult<bool>;
}

/// 看门狗审计记录仓储
#[async_trait]
pub trait TaskAuditRepository: Send + Sync {
    async fn record(&self, record: &TaskAuditRecord) -> FleetResult<()>;

    async fn list_for_task(&self, tenant_id: &str, task_id: &str)
        -> FleetResult<Vec<TaskAuditRecord>>;
}
