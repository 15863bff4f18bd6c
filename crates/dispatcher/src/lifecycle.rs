use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use fleet_core::{
    config::LifecycleConfig,
    models::{HostStatus, StatusTransition, Tenant, TenantStatus, UpdateValue, WorkerHost},
    traits::{
        CacheKeys, CacheService, GatewayConfigSource, HostRepository, LeaseService,
        RemoteExecutor, TenantRepository, WakeReservation,
    },
    FleetError, FleetResult,
};
use fleet_infrastructure::MetricsCollector;

use crate::capacity_registry::CapacityRegistry;
use crate::commands::{run_checked, ContainerCommands};
use crate::lease::run_exclusive;

/// 唤醒结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// 本调用完成了 sleeping → active 并启动了容器
    Woken,
    /// 其他调用方已经唤醒，或容器本来就在运行
    AlreadyActive,
    /// 当前状态不允许唤醒
    CannotWake(TenantStatus),
}

/// 休眠判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepDecision {
    Sleep,
    TooYoung,
    AlwaysOnChannel,
    NotIdle,
}

/// 判断一个 active 租户是否应该休眠
pub fn sleep_decision(tenant: &Tenant, now: DateTime<Utc>, config: &LifecycleConfig) -> SleepDecision {
    if tenant.age(now) < config.min_age() {
        return SleepDecision::TooYoung;
    }
    if tenant.has_always_on_channel() {
        return SleepDecision::AlwaysOnChannel;
    }
    if tenant.idle_duration(now) > config.sleep_after() {
        SleepDecision::Sleep
    } else {
        SleepDecision::NotIdle
    }
}

/// 一轮休眠扫描的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SleepSweepReport {
    pub examined: usize,
    pub slept: usize,
    pub failed: usize,
    pub restarted: usize,
}

/// 容器生命周期管理器
pub struct ContainerLifecycleManager {
    tenants: Arc<dyn TenantRepository>,
    hosts: Arc<dyn HostRepository>,
    registry: Arc<CapacityRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    gateway: Arc<dyn GatewayConfigSource>,
    cache: Arc<dyn CacheService>,
    lease: Arc<dyn LeaseService>,
    commands: ContainerCommands,
    config: LifecycleConfig,
    command_timeout: Duration,
    status_ttl: Duration,
    instance_id: String,
    metrics: Arc<MetricsCollector>,
}

impl ContainerLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        hosts: Arc<dyn HostRepository>,
        registry: Arc<CapacityRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        gateway: Arc<dyn GatewayConfigSource>,
        cache: Arc<dyn CacheService>,
        lease: Arc<dyn LeaseService>,
        commands: ContainerCommands,
        config: LifecycleConfig,
        command_timeout: Duration,
        status_ttl: Duration,
        instance_id: String,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            tenants,
            hosts,
            registry,
            executor,
            gateway,
            cache,
            lease,
            commands,
            config,
            command_timeout,
            status_ttl,
            instance_id,
            metrics,
        }
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> FleetResult<Tenant> {
        self.tenants
            .get_by_id(tenant_id)
            .await?
            .ok_or_else(|| FleetError::TenantNotFound {
                id: tenant_id.to_string(),
            })
    }

    async fn host_for(&self, tenant: &Tenant) -> FleetResult<WorkerHost> {
        let host_id = tenant.assigned_host_id.as_deref().ok_or_else(|| {
            FleetError::Internal(format!("租户 {} 没有绑定主机", tenant.id))
        })?;
        self.registry.get_host(host_id).await
    }

    async fn remote(&self, host: &WorkerHost, command: &str, operation: &str) -> FleetResult<()> {
        run_checked(self.executor.as_ref(), &host.address, command, self.command_timeout)
            .await
            .map(|_| ())
            .map_err(|e| {
                self.metrics.record_remote_failure(operation);
                e
            })
    }

    /// 启动已分配主机的租户容器：provisioning → starting → active
    ///
    /// 只有赢得 provisioning → starting 的调用方执行启动流程。远程失败时租户
    /// 停留在 starting，由卡住启动的对账任务重试。
    pub async fn start_container(&self, tenant_id: &str) -> FleetResult<Tenant> {
        self.claim_and_start(tenant_id, None).await
    }

    /// `stalled_before` 为 Some 时允许接管 `updated_at` 早于该时间的 starting 租户
    async fn claim_and_start(
        &self,
        tenant_id: &str,
        stalled_before: Option<DateTime<Utc>>,
    ) -> FleetResult<Tenant> {
        let tenant = self.get_tenant(tenant_id).await?;
        let claim = match (tenant.status, stalled_before) {
            (TenantStatus::Provisioning, _) => StatusTransition::new(
                tenant_id,
                &[TenantStatus::Provisioning],
                TenantStatus::Starting,
            ),
            (TenantStatus::Starting, Some(cutoff)) => StatusTransition::new(
                tenant_id,
                &[TenantStatus::Starting],
                TenantStatus::Starting,
            )
            .updated_before(cutoff),
            (TenantStatus::Starting, None)
            | (TenantStatus::Active, _)
            | (TenantStatus::GracePeriod, _) => {
                debug!("租户 {} 处于 {}，无需启动", tenant_id, tenant.status);
                return Ok(tenant);
            }
            (other, _) => {
                return Err(FleetError::InvalidTransition {
                    tenant_id: tenant_id.to_string(),
                    from: other.to_string(),
                    action: "start".to_string(),
                })
            }
        };

        let Some(tenant) = self.tenants.transition(&claim).await? else {
            debug!("租户 {} 的启动已被其他调用方接管", tenant_id);
            return self.get_tenant(tenant_id).await;
        };

        let host = self.host_for(&tenant).await?;
        self.start_and_configure(&host, &tenant, "start").await?;

        let activate =
            StatusTransition::new(tenant_id, &[TenantStatus::Starting], TenantStatus::Active);
        let tenant = match self.tenants.transition(&activate).await? {
            Some(tenant) => tenant,
            None => self.get_tenant(tenant_id).await?,
        };

        self.registry.recompute(&host.id).await?;
        self.cache_status(&tenant).await;
        self.metrics.record_container_started();
        info!("租户 {} 容器已在主机 {} 上启动", tenant_id, host.id);
        Ok(tenant)
    }

    /// 启动容器、等待健康检查并重新下发网关配置
    async fn start_and_configure(
        &self,
        host: &WorkerHost,
        tenant: &Tenant,
        operation: &str,
    ) -> FleetResult<()> {
        let memory_mb = self.registry.ram_for(tenant.plan_tier);
        self.remote(host, &self.commands.start(tenant, memory_mb), operation)
            .await?;

        if !self.wait_healthy(host, tenant).await {
            let timeout = FleetError::HealthCheckTimeout {
                tenant_id: tenant.id.clone(),
                waited_secs: self.config.health_timeout_seconds,
            };
            warn!("{}，继续执行启动流程", timeout);
        }

        // 容器启动流程会清掉鉴权相关的配置项，每次启动后都必须重新下发
        self.apply_gateway_config(host, tenant).await
    }

    /// 在限定时间内轮询健康检查，超时返回 false
    async fn wait_healthy(&self, host: &WorkerHost, tenant: &Tenant) -> bool {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.health_timeout_seconds);
        let poll = Duration::from_secs(self.config.health_poll_interval_seconds);
        let command = self.commands.health(&tenant.container());

        loop {
            match self.executor.run(&host.address, &command, poll.max(Duration::from_secs(1))).await {
                Ok(output) if output.is_success() => {
                    debug!("租户 {} 健康检查通过", tenant.id);
                    return true;
                }
                Ok(_) => {}
                Err(e) => debug!("租户 {} 健康检查失败: {}", tenant.id, e),
            }

            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn apply_gateway_config(&self, host: &WorkerHost, tenant: &Tenant) -> FleetResult<()> {
        let config = self.gateway.authoritative_config(tenant).await?;
        let command = self
            .commands
            .apply_gateway_config(&tenant.container(), &config)?;
        self.remote(host, &command, "gateway_config").await?;
        debug!("租户 {} 网关配置已重新下发", tenant.id);
        Ok(())
    }

    /// 执行休眠扫描（持有分布式租约时）
    pub async fn run_sleep_sweep(&self) -> FleetResult<Option<SleepSweepReport>> {
        let ttl = Duration::from_secs(self.config.sleep_sweep_interval_seconds);
        run_exclusive(
            self.lease.as_ref(),
            CacheKeys::SLEEP_SWEEP_LEASE,
            &self.instance_id,
            ttl,
            self.sleep_sweep_once(),
        )
        .await
    }

    /// 一轮休眠扫描，每个租户的失败相互隔离
    pub async fn sleep_sweep_once(&self) -> FleetResult<SleepSweepReport> {
        let now = Utc::now();
        let active = self.tenants.list_by_status(&[TenantStatus::Active]).await?;
        let mut report = SleepSweepReport {
            examined: active.len(),
            ..Default::default()
        };

        for tenant in &active {
            if sleep_decision(tenant, now, &self.config) != SleepDecision::Sleep {
                continue;
            }
            match self.sleep_tenant(tenant).await {
                Ok(true) => report.slept += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("租户 {} 休眠失败，下轮重试: {}", tenant.id, e);
                    report.failed += 1;
                }
            }
        }

        report.restarted = self.reconcile_stalled_starts().await?;

        if report.slept > 0 || report.failed > 0 {
            info!(
                "休眠扫描完成: 检查 {} 个，休眠 {} 个，失败 {} 个",
                report.examined, report.slept, report.failed
            );
        }
        Ok(report)
    }

    /// 停止空闲容器并释放预订
    ///
    /// 停止前重新读取租户；转换附带空闲条件，停止期间有新活跃记录时
    /// 转换失败并重新启动容器。
    pub async fn sleep_tenant(&self, tenant: &Tenant) -> FleetResult<bool> {
        let cutoff = Utc::now() - self.config.sleep_after();
        let tenant = self.get_tenant(&tenant.id).await?;
        if tenant.status != TenantStatus::Active || tenant.last_active_at > cutoff {
            debug!("租户 {} 已有新的活跃记录，取消休眠", tenant.id);
            return Ok(false);
        }

        let transition =
            StatusTransition::new(&tenant.id, &[TenantStatus::Active], TenantStatus::Sleeping)
                .idle_since(cutoff);
        if self.stop_and_transition(&tenant, &transition).await?.is_some() {
            self.metrics.record_container_slept();
            info!("租户 {} 空闲超时，容器已休眠", tenant.id);
            return Ok(true);
        }

        self.restart_after_interrupted_sleep(&tenant.id).await?;
        Ok(false)
    }

    /// 休眠转换失败但容器已停止：租户仍为 active 时重新启动容器
    ///
    /// 重启失败时转为 sleeping，下一次请求经唤醒流程恢复。
    async fn restart_after_interrupted_sleep(&self, tenant_id: &str) -> FleetResult<()> {
        let tenant = self.get_tenant(tenant_id).await?;
        if tenant.status != TenantStatus::Active {
            return Ok(());
        }

        let host = self.host_for(&tenant).await?;
        info!("租户 {} 在停止期间重新活跃，重新启动容器", tenant_id);
        if let Err(e) = self.start_and_configure(&host, &tenant, "restart").await {
            error!("租户 {} 重新启动失败，转为 sleeping: {}", tenant_id, e);
            let fallback =
                StatusTransition::new(tenant_id, &[TenantStatus::Active], TenantStatus::Sleeping);
            self.tenants.transition(&fallback).await?;
            self.registry.recompute(&host.id).await?;
            self.invalidate_status(tenant_id).await;
            return Err(e);
        }
        self.cache_status(&tenant).await;
        Ok(())
    }

    /// 先停止容器，再执行条件转换、重新计算预订量并清除状态缓存
    ///
    /// 停止失败时状态保持不变，运行中的容器始终有预订。
    pub async fn stop_and_transition(
        &self,
        tenant: &Tenant,
        transition: &StatusTransition,
    ) -> FleetResult<Option<Tenant>> {
        let host = match tenant.assigned_host_id.as_deref() {
            Some(host_id) => self.hosts.get_by_id(host_id).await?,
            None => None,
        };

        if let Some(host) = &host {
            if host.status == HostStatus::Offline {
                warn!("主机 {} 离线，跳过停止租户 {} 的容器", host.id, tenant.id);
            } else {
                self.remote(host, &self.commands.stop(&tenant.container()), "stop")
                    .await?;
            }
        }

        let Some(updated) = self.tenants.transition(transition).await? else {
            debug!("租户 {} 状态已被其他调用方改变", tenant.id);
            return Ok(None);
        };

        if let Some(host) = &host {
            self.registry.recompute(&host.id).await?;
        }
        self.invalidate_status(&tenant.id).await;
        Ok(Some(updated))
    }

    /// 重试卡在 provisioning/starting 的租户
    pub async fn reconcile_stalled_starts(&self) -> FleetResult<usize> {
        let before = Utc::now() - self.config.stalled_start_after();
        let stalled = self
            .tenants
            .list_stalled(&[TenantStatus::Provisioning, TenantStatus::Starting], before)
            .await?;

        let mut restarted = 0;
        for tenant in stalled {
            warn!("租户 {} 启动停滞于 {}，重试启动", tenant.id, tenant.status);
            match self.claim_and_start(&tenant.id, Some(before)).await {
                Ok(tenant) if tenant.status == TenantStatus::Active => restarted += 1,
                Ok(_) => {}
                Err(e) => error!("租户 {} 重试启动失败: {}", tenant.id, e),
            }
        }
        Ok(restarted)
    }

    /// 唤醒休眠租户
    ///
    /// 并发调用时只有赢得 sleeping → active 条件转换的调用方执行启动流程，
    /// 其余调用方返回 `AlreadyActive`。
    pub async fn wake(&self, tenant_id: &str) -> FleetResult<WakeOutcome> {
        let started = Instant::now();
        let tenant = self.get_tenant(tenant_id).await?;
        let required_mb = self.registry.ram_for(tenant.plan_tier);

        match self.hosts.wake_on_assigned_host(tenant_id, required_mb).await? {
            WakeReservation::Claimed { host, tenant } => {
                self.complete_wake(&host, &tenant).await?;
                self.metrics.record_wake(started.elapsed().as_secs_f64());
                info!(
                    "租户 {} 已在主机 {} 上唤醒，用时 {:.1}s",
                    tenant_id,
                    host.id,
                    started.elapsed().as_secs_f64()
                );
                Ok(WakeOutcome::Woken)
            }
            WakeReservation::NotSleeping(status) => {
                if status == TenantStatus::Active {
                    // 唤醒请求同时记为一次活跃，进行中的休眠转换因此失败
                    self.tenants.touch_activity(tenant_id, Utc::now()).await?;
                }
                Ok(classify_not_sleeping(status))
            }
            WakeReservation::InsufficientCapacity {
                host_id,
                required_mb,
            } => {
                warn!(
                    "租户 {} 所在主机 {} 余量不足 {}MB，无法唤醒",
                    tenant_id, host_id, required_mb
                );
                self.metrics.record_capacity_exhausted(required_mb);
                Err(FleetError::CapacityExhausted { required_mb })
            }
        }
    }

    async fn complete_wake(&self, host: &WorkerHost, tenant: &Tenant) -> FleetResult<()> {
        let clear_locks = self.commands.clear_session_locks(&tenant.id);
        if let Err(e) = self.remote(host, &clear_locks, "clear_locks").await {
            warn!("清除租户 {} 会话锁失败: {}", tenant.id, e);
        }

        if let Err(e) = self.start_and_configure(host, tenant, "wake").await {
            error!("租户 {} 唤醒失败，回滚为 sleeping: {}", tenant.id, e);
            self.compensate_failed_wake(host, tenant).await;
            return Err(e);
        }

        self.registry.recompute(&host.id).await?;
        self.cache_status(tenant).await;
        Ok(())
    }

    /// 唤醒失败的补偿：停止可能已启动的容器，active → sleeping，释放预订
    async fn compensate_failed_wake(&self, host: &WorkerHost, tenant: &Tenant) {
        let stop = self.commands.stop(&tenant.container());
        if let Err(e) = self.remote(host, &stop, "stop").await {
            warn!("补偿时停止租户 {} 容器失败: {}", tenant.id, e);
        }

        let rollback =
            StatusTransition::new(&tenant.id, &[TenantStatus::Active], TenantStatus::Sleeping);
        if let Err(e) = self.tenants.transition(&rollback).await {
            error!("租户 {} 回滚为 sleeping 失败: {}", tenant.id, e);
        }
        if let Err(e) = self.registry.recompute(&host.id).await {
            error!("主机 {} 补偿后重新计算失败: {}", host.id, e);
        }
        self.invalidate_status(&tenant.id).await;
    }

    /// 记录活跃时间，每个租户在去抖窗口内只写一次存储
    pub async fn touch_activity(&self, tenant_id: &str) -> FleetResult<bool> {
        let key = CacheKeys::activity_debounce(tenant_id);
        let window = Duration::from_secs(self.config.activity_debounce_seconds);
        match self.lease.try_acquire(&key, &self.instance_id, window).await {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => warn!("活跃去抖租约不可用，直接写入: {}", e),
        }

        if !self.tenants.touch_activity(tenant_id, Utc::now()).await? {
            return Err(FleetError::TenantNotFound {
                id: tenant_id.to_string(),
            });
        }
        Ok(true)
    }

    /// 显式取消：任意非终止状态 → cancelled
    pub async fn cancel(&self, tenant_id: &str) -> FleetResult<Tenant> {
        let tenant = self.get_tenant(tenant_id).await?;
        if tenant.status.is_terminal() {
            return Ok(tenant);
        }

        let transition = StatusTransition::new(
            tenant_id,
            &TenantStatus::CANCELLABLE,
            TenantStatus::Cancelled,
        )
        .with_cancelled_at(UpdateValue::Set(Utc::now()))
        .with_grace_period_end(UpdateValue::Unset);

        match self.stop_and_transition(&tenant, &transition).await? {
            Some(cancelled) => {
                info!("租户 {} 已取消", tenant_id);
                Ok(cancelled)
            }
            None => self.get_tenant(tenant_id).await,
        }
    }

    /// 删除容器和数据目录，随后重新计算主机预订量
    pub async fn purge_container(&self, tenant: &Tenant) -> FleetResult<()> {
        let Some(host_id) = tenant.assigned_host_id.as_deref() else {
            return Ok(());
        };
        let Some(host) = self.hosts.get_by_id(host_id).await? else {
            warn!("租户 {} 绑定的主机 {} 已不存在，跳过删除容器", tenant.id, host_id);
            return Ok(());
        };

        let command = self.commands.remove(&tenant.container(), &tenant.id);
        self.remote(&host, &command, "purge").await?;
        self.registry.recompute(&host.id).await?;
        self.invalidate_status(&tenant.id).await;
        Ok(())
    }

    /// 读取租户状态，优先使用短期缓存
    pub async fn cached_status(&self, tenant_id: &str) -> FleetResult<TenantStatus> {
        let key = CacheKeys::tenant_status(tenant_id);
        match self.cache.get(&key).await {
            Ok(Some(value)) => {
                if let Ok(status) = value.parse::<TenantStatus>() {
                    return Ok(status);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("读取状态缓存失败: {}", e),
        }

        let tenant = self.get_tenant(tenant_id).await?;
        self.cache_status(&tenant).await;
        Ok(tenant.status)
    }

    async fn cache_status(&self, tenant: &Tenant) {
        let key = CacheKeys::tenant_status(&tenant.id);
        if let Err(e) = self
            .cache
            .set(&key, tenant.status.as_str(), self.status_ttl)
            .await
        {
            warn!("写入租户 {} 状态缓存失败: {}", tenant.id, e);
        }
    }

    pub async fn invalidate_status(&self, tenant_id: &str) {
        if let Err(e) = self.cache.delete(&CacheKeys::tenant_status(tenant_id)).await {
            warn!("清除租户 {} 状态缓存失败: {}", tenant_id, e);
        }
    }
}

fn classify_not_sleeping(status: TenantStatus) -> WakeOutcome {
    match status {
        TenantStatus::Active
        | TenantStatus::Starting
        | TenantStatus::Provisioning
        | TenantStatus::GracePeriod => WakeOutcome::AlreadyActive,
        other => WakeOutcome::CannotWake(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleet_core::models::ChannelKind;
    use fleet_testing_utils::TenantBuilder;

    fn active(age_minutes: i64, idle_minutes: i64) -> TenantBuilder {
        TenantBuilder::new()
            .with_status(TenantStatus::Active)
            .on_host("h1")
            .aged(ChronoDuration::minutes(age_minutes))
            .idle_for(ChronoDuration::minutes(idle_minutes))
    }

    #[test]
    fn test_idle_old_tenant_sleeps() {
        let config = LifecycleConfig::default();
        let tenant = active(120, 31).build();
        assert_eq!(sleep_decision(&tenant, Utc::now(), &config), SleepDecision::Sleep);
    }

    #[test]
    fn test_young_tenant_never_sleeps() {
        let config = LifecycleConfig::default();
        let tenant = active(59, 59).build();
        assert_eq!(sleep_decision(&tenant, Utc::now(), &config), SleepDecision::TooYoung);
    }

    #[test]
    fn test_always_on_channel_never_sleeps() {
        let config = LifecycleConfig::default();
        let tenant = active(600, 600)
            .with_channels(vec![ChannelKind::Web, ChannelKind::Discord])
            .build();
        assert_eq!(
            sleep_decision(&tenant, Utc::now(), &config),
            SleepDecision::AlwaysOnChannel
        );
    }

    #[test]
    fn test_recent_activity_keeps_running() {
        let config = LifecycleConfig::default();
        let tenant = active(120, 29).build();
        assert_eq!(sleep_decision(&tenant, Utc::now(), &config), SleepDecision::NotIdle);
    }

    #[test]
    fn test_classify_not_sleeping() {
        assert_eq!(
            classify_not_sleeping(TenantStatus::Active),
            WakeOutcome::AlreadyActive
        );
        assert_eq!(
            classify_not_sleeping(TenantStatus::Paused),
            WakeOutcome::CannotWake(TenantStatus::Paused)
        );
        assert_eq!(
            classify_not_sleeping(TenantStatus::Pending),
            WakeOutcome::CannotWake(TenantStatus::Pending)
        );
    }
}
