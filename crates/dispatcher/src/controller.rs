use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use fleet_core::{
    models::{
        BillingEvent, HostRegistration, HostStatus, NewTenant, RegisteredHost, TaskWatchStatus,
        Tenant, TenantStatus, WorkerHost,
    },
    traits::{
        CacheService, CloudProvisioner, CredentialRevoker, GatewayConfigSource, HostRepository,
        LeaseService, Notifier, RemoteExecutor, TaskAuditRepository, TenantRepository,
        TenantReservation,
    },
    AppConfig, FleetError, FleetResult,
};
use fleet_infrastructure::MetricsCollector;

use crate::capacity_registry::{CapacityRegistry, FleetCapacity};
use crate::commands::ContainerCommands;
use crate::grace_period::{GracePeriodScheduler, GraceSweepReport};
use crate::host_health_monitor::{HostHealthMonitor, HostHealthReport};
use crate::lifecycle::{ContainerLifecycleManager, SleepSweepReport, WakeOutcome};
use crate::provisioning::ProvisioningCoordinator;
use crate::runaway_monitor::RunawayTaskMonitor;

/// 编排器依赖的外部协作方
#[derive(Clone)]
pub struct FleetDependencies {
    pub hosts: Arc<dyn HostRepository>,
    pub tenants: Arc<dyn TenantRepository>,
    pub audit: Arc<dyn TaskAuditRepository>,
    pub cache: Arc<dyn CacheService>,
    pub lease: Arc<dyn LeaseService>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub cloud: Arc<dyn CloudProvisioner>,
    pub notifier: Arc<dyn Notifier>,
    pub revoker: Arc<dyn CredentialRevoker>,
    pub gateway: Arc<dyn GatewayConfigSource>,
}

/// 编排器门面，供内部HTTP接口和周期任务调用
pub struct FleetController {
    registry: Arc<CapacityRegistry>,
    provisioning: Arc<ProvisioningCoordinator>,
    lifecycle: Arc<ContainerLifecycleManager>,
    grace: Arc<GracePeriodScheduler>,
    monitor: RunawayTaskMonitor,
    host_health: Arc<HostHealthMonitor>,
    tenants: Arc<dyn TenantRepository>,
    cloud: Arc<dyn CloudProvisioner>,
}

impl FleetController {
    pub fn new(
        config: &AppConfig,
        deps: FleetDependencies,
        metrics: Arc<MetricsCollector>,
        instance_id: String,
    ) -> Self {
        let commands = ContainerCommands::new(&config.remote, &config.gateway);

        let registry = Arc::new(CapacityRegistry::new(
            deps.hosts.clone(),
            config.capacity.plans,
            metrics.clone(),
        ));

        let provisioning = Arc::new(ProvisioningCoordinator::new(
            deps.hosts.clone(),
            deps.tenants.clone(),
            deps.cloud.clone(),
            deps.lease.clone(),
            deps.executor.clone(),
            commands.clone(),
            config.provisioning.clone(),
            config.cloud.clone(),
            config.api.internal_token.clone(),
            instance_id.clone(),
            metrics.clone(),
        ));

        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            deps.tenants.clone(),
            deps.hosts.clone(),
            registry.clone(),
            deps.executor.clone(),
            deps.gateway.clone(),
            deps.cache.clone(),
            deps.lease.clone(),
            commands,
            config.lifecycle.clone(),
            config.remote.command_timeout(),
            Duration::from_secs(config.cache.status_ttl_seconds),
            instance_id.clone(),
            metrics.clone(),
        ));

        let grace = Arc::new(GracePeriodScheduler::new(
            deps.tenants.clone(),
            lifecycle.clone(),
            deps.notifier.clone(),
            deps.revoker.clone(),
            deps.lease.clone(),
            config.grace.clone(),
            instance_id.clone(),
            metrics.clone(),
        ));

        let monitor = RunawayTaskMonitor::new(deps.audit.clone(), config.watchdog.clone(), metrics);

        let host_health = Arc::new(HostHealthMonitor::new(
            registry.clone(),
            deps.hosts.clone(),
            deps.executor.clone(),
            deps.lease.clone(),
            Duration::from_secs(config.lifecycle.host_health_interval_seconds),
            Duration::from_secs(config.remote.connect_timeout_seconds),
            instance_id,
        ));

        Self {
            registry,
            provisioning,
            lifecycle,
            grace,
            monitor,
            host_health,
            tenants: deps.tenants,
            cloud: deps.cloud,
        }
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    pub fn grace(&self) -> &Arc<GracePeriodScheduler> {
        &self.grace
    }

    pub fn monitor(&self) -> &RunawayTaskMonitor {
        &self.monitor
    }

    pub fn host_health(&self) -> &Arc<HostHealthMonitor> {
        &self.host_health
    }

    // ---- 主机 ----

    /// 主机启动回调：幂等注册，首次注册时后台预热镜像
    pub async fn register_host(&self, mut registration: HostRegistration) -> FleetResult<RegisteredHost> {
        registration.provider_id = registration
            .provider_id
            .filter(|id| !id.trim().is_empty());

        let registered = self.registry.register_host(&registration).await?;
        self.provisioning.on_host_registered(&registered);
        Ok(registered)
    }

    /// 预订内存；容量耗尽且允许创建时等待新主机后重试一次
    ///
    /// 不绑定租户的预订只是临时的，下一次重新计算会把它修正为租户预订之和。
    pub async fn request_capacity(&self, ram_mb: i64, allow_create: bool) -> FleetResult<WorkerHost> {
        if ram_mb <= 0 {
            return Err(FleetError::InvalidInput(format!("预订内存必须大于0: {ram_mb}")));
        }

        match self.registry.reserve(ram_mb).await {
            Err(FleetError::CapacityExhausted { .. })
                if allow_create && self.provisioning.auto_create_enabled() =>
            {
                self.provisioning.ensure_capacity(ram_mb).await?;
                self.registry.reserve(ram_mb).await
            }
            other => other,
        }
    }

    pub async fn list_hosts(&self) -> FleetResult<Vec<WorkerHost>> {
        self.registry.list_hosts().await
    }

    pub async fn fleet_capacity(&self) -> FleetResult<FleetCapacity> {
        self.registry.refresh_fleet_metrics().await
    }

    pub async fn set_host_status(&self, host_id: &str, status: HostStatus) -> FleetResult<WorkerHost> {
        self.registry.set_host_status(host_id, status).await
    }

    /// 移除没有租户的主机，并删除云服务商上的服务器
    pub async fn remove_host(&self, host_id: &str) -> FleetResult<WorkerHost> {
        let host = self.registry.remove_host(host_id).await?;
        if let Some(provider_id) = &host.provider_id {
            if let Err(e) = self.cloud.delete_host(provider_id).await {
                error!(
                    "主机 {} 已从集群移除，但删除云服务器 {} 失败，需要人工处理: {}",
                    host.id, provider_id, e
                );
            }
        }
        Ok(host)
    }

    // ---- 租户 ----

    pub async fn create_tenant(&self, new_tenant: NewTenant) -> FleetResult<Tenant> {
        if new_tenant.id.trim().is_empty() {
            return Err(FleetError::InvalidInput("租户ID不能为空".to_string()));
        }
        let tenant = self.tenants.create(&new_tenant).await?;
        info!("租户 {} 已创建 (套餐 {})", tenant.id, tenant.plan_tier);
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> FleetResult<Tenant> {
        self.lifecycle.get_tenant(tenant_id).await
    }

    pub async fn tenant_status(&self, tenant_id: &str) -> FleetResult<TenantStatus> {
        self.lifecycle.cached_status(tenant_id).await
    }

    /// 为 pending 租户分配主机并启动容器
    ///
    /// 已经分配的租户会继续未完成的启动，已运行的租户原样返回。
    pub async fn provision_tenant(&self, tenant_id: &str) -> FleetResult<Tenant> {
        let tenant = self.lifecycle.get_tenant(tenant_id).await?;
        match tenant.status {
            TenantStatus::Pending => {}
            TenantStatus::Provisioning | TenantStatus::Starting => {
                return self.lifecycle.start_container(tenant_id).await
            }
            _ => return Ok(tenant),
        }

        let required_mb = self.registry.ram_for(tenant.plan_tier);
        let mut created = false;
        loop {
            match self.registry.reserve_for_tenant(&tenant).await? {
                TenantReservation::Assigned { .. } => {
                    return self.lifecycle.start_container(tenant_id).await;
                }
                TenantReservation::NotPending(status) => {
                    info!("租户 {} 已由其他调用方处理 ({})", tenant_id, status);
                    return self.lifecycle.get_tenant(tenant_id).await;
                }
                TenantReservation::Exhausted => {
                    if created || !self.provisioning.auto_create_enabled() {
                        return Err(FleetError::CapacityExhausted { required_mb });
                    }
                    warn!("租户 {} 暂无可用主机，等待新主机", tenant_id);
                    self.provisioning.ensure_capacity(required_mb).await?;
                    created = true;
                }
            }
        }
    }

    pub async fn wake(&self, tenant_id: &str) -> FleetResult<WakeOutcome> {
        self.lifecycle.wake(tenant_id).await
    }

    pub async fn touch_activity(&self, tenant_id: &str) -> FleetResult<bool> {
        self.lifecycle.touch_activity(tenant_id).await
    }

    pub async fn cancel_tenant(&self, tenant_id: &str) -> FleetResult<Tenant> {
        self.grace.on_subscription_cancelled(tenant_id).await
    }

    pub async fn handle_billing_event(&self, event: &BillingEvent) -> FleetResult<bool> {
        self.grace.handle_billing_event(event).await
    }

    // ---- 任务看门狗 ----

    pub async fn start_task(&self, tenant_id: &str, task_id: &str) -> FleetResult<()> {
        self.lifecycle.get_tenant(tenant_id).await?;
        self.monitor.start_task_monitor(tenant_id, task_id).await;
        Ok(())
    }

    pub async fn stop_task(&self, tenant_id: &str, task_id: &str) -> bool {
        self.monitor.stop_task_monitor(tenant_id, task_id).await
    }

    pub async fn record_task_action(&self, tenant_id: &str, task_id: &str, action_type: &str) -> bool {
        self.monitor.record_action(tenant_id, task_id, action_type).await
    }

    pub async fn add_task_tokens(&self, tenant_id: &str, task_id: &str, tokens: u64) -> bool {
        self.monitor.add_tokens(tenant_id, task_id, tokens).await
    }

    pub async fn task_paused(&self, tenant_id: &str, task_id: &str) -> bool {
        self.monitor.is_paused(tenant_id, task_id).await
    }

    pub async fn task_status(&self, tenant_id: &str, task_id: &str) -> FleetResult<TaskWatchStatus> {
        self.monitor.task_status(tenant_id, task_id).await
    }

    // ---- 周期任务 ----

    pub async fn run_sleep_sweep(&self) -> FleetResult<Option<SleepSweepReport>> {
        self.lifecycle.run_sleep_sweep().await
    }

    pub async fn run_grace_sweep(&self) -> FleetResult<Option<GraceSweepReport>> {
        self.grace.run_sweep().await
    }

    pub async fn run_host_health(&self) -> FleetResult<Option<HostHealthReport>> {
        self.host_health.run_check().await
    }
}
