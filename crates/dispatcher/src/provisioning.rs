use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{error, info, warn};

use fleet_core::{
    config::{CloudConfig, ProvisioningConfig},
    models::{RegisteredHost, TenantStatus},
    traits::{
        CacheKeys, CloudProvisioner, HostCreateRequest, HostRepository, LeaseService,
        RemoteExecutor, TenantRepository,
    },
    FleetError, FleetResult,
};
use fleet_infrastructure::MetricsCollector;

use crate::commands::{run_checked, ContainerCommands};

/// 一次主机创建的失败结果，所有等待者共享同一个值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningFailure {
    /// 没有租户在等待主机，放弃创建
    NoDemand { required_mb: i64 },
    Timeout { waited_secs: u64 },
    Failed(String),
}

impl From<ProvisioningFailure> for FleetError {
    fn from(failure: ProvisioningFailure) -> Self {
        match failure {
            ProvisioningFailure::NoDemand { required_mb } => {
                FleetError::CapacityExhausted { required_mb }
            }
            ProvisioningFailure::Timeout { waited_secs } => {
                FleetError::ProvisioningTimeout { waited_secs }
            }
            ProvisioningFailure::Failed(message) => FleetError::Provisioning(message),
        }
    }
}

type InFlight = Shared<BoxFuture<'static, Result<(), ProvisioningFailure>>>;

struct Inner {
    hosts: Arc<dyn HostRepository>,
    tenants: Arc<dyn TenantRepository>,
    cloud: Arc<dyn CloudProvisioner>,
    lease: Arc<dyn LeaseService>,
    executor: Arc<dyn RemoteExecutor>,
    commands: ContainerCommands,
    config: ProvisioningConfig,
    cloud_config: CloudConfig,
    callback_token: Option<String>,
    instance_id: String,
    metrics: Arc<MetricsCollector>,
}

/// 新主机创建协调器
///
/// 单飞保证分两层：进程内所有调用方等待同一个共享future；跨实例通过
/// Redis租约保证只有一个实例调用云服务商API，其余实例只等待新主机注册。
pub struct ProvisioningCoordinator {
    inner: Arc<Inner>,
    in_flight: Mutex<Option<InFlight>>,
}

impl ProvisioningCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Arc<dyn HostRepository>,
        tenants: Arc<dyn TenantRepository>,
        cloud: Arc<dyn CloudProvisioner>,
        lease: Arc<dyn LeaseService>,
        executor: Arc<dyn RemoteExecutor>,
        commands: ContainerCommands,
        config: ProvisioningConfig,
        cloud_config: CloudConfig,
        callback_token: Option<String>,
        instance_id: String,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hosts,
                tenants,
                cloud,
                lease,
                executor,
                commands,
                config,
                cloud_config,
                callback_token,
                instance_id,
                metrics,
            }),
            in_flight: Mutex::new(None),
        }
    }

    pub fn auto_create_enabled(&self) -> bool {
        self.inner.config.auto_create
    }

    /// 等待集群中出现能接纳 `required_mb` 的主机，必要时创建新主机
    ///
    /// 只在预订返回 `CapacityExhausted` 之后调用。返回成功不代表已经预订，
    /// 调用方需要重新走一次原子预订。
    pub async fn ensure_capacity(&self, required_mb: i64) -> FleetResult<()> {
        let shared = self.join_or_start(required_mb)?;
        shared.await.map_err(FleetError::from)
    }

    fn join_or_start(&self, required_mb: i64) -> FleetResult<InFlight> {
        let mut slot = self
            .in_flight
            .lock()
            .map_err(|_| FleetError::Internal("provisioning slot poisoned".to_string()))?;

        if let Some(existing) = slot.as_ref() {
            // 已完成的结果不复用，下一次需求重新检查
            if existing.peek().is_none() {
                info!("已有主机创建在进行中，等待其结果");
                return Ok(existing.clone());
            }
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.provision(required_mb).await });
        let shared = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(ProvisioningFailure::Failed(format!("创建任务异常退出: {e}"))))
        }
        .boxed()
        .shared();

        *slot = Some(shared.clone());
        Ok(shared)
    }

    /// 主机首次注册后在后台预热基础镜像，失败只记录日志
    pub fn on_host_registered(&self, registered: &RegisteredHost) {
        if !registered.is_new {
            return;
        }

        let inner = self.inner.clone();
        let host = registered.host.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(inner.config.prewarm_timeout_seconds);
            let command = inner.commands.pull_image();
            match run_checked(inner.executor.as_ref(), &host.address, &command, timeout).await {
                Ok(_) => info!("主机 {} 镜像预热完成: {}", host.id, inner.commands.image()),
                Err(e) => warn!("主机 {} 镜像预热失败: {}", host.id, e),
            }
        });
    }
}

impl Inner {
    async fn provision(&self, required_mb: i64) -> Result<(), ProvisioningFailure> {
        if self.hosts.has_headroom(required_mb).await.map_err(failed)? {
            return Ok(());
        }

        let waiting = self
            .tenants
            .count_by_status(TenantStatus::Pending)
            .await
            .map_err(failed)?;
        if waiting == 0 {
            info!("没有等待分配的租户，不创建新主机");
            return Err(ProvisioningFailure::NoDemand { required_mb });
        }

        let lease_ttl = Duration::from_secs(self.config.lease_ttl_seconds);
        let acquired = self
            .lease
            .try_acquire(CacheKeys::PROVISIONING_LEASE, &self.instance_id, lease_ttl)
            .await
            .map_err(failed)?;

        if !acquired {
            info!("其他实例正在创建主机，等待新主机注册");
            return self.wait_for_headroom(required_mb).await;
        }

        let result = self.create_and_wait(required_mb, waiting).await;

        if let Err(e) = self
            .lease
            .release(CacheKeys::PROVISIONING_LEASE, &self.instance_id)
            .await
        {
            warn!("释放主机创建租约失败: {}", e);
        }
        result
    }

    async fn create_and_wait(&self, required_mb: i64, waiting: i64) -> Result<(), ProvisioningFailure> {
        let started = Instant::now();
        let request = HostCreateRequest {
            name: format!("fleet-worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            server_type: self.cloud_config.server_type.clone(),
            image: self.cloud_config.image.clone(),
            region: self.cloud_config.region.clone(),
            user_data: bootstrap_script(
                &self.cloud_config.register_callback_url,
                self.callback_token.as_deref(),
            ),
        };

        info!(
            "容量耗尽，{} 个租户等待中，创建新主机 {} ({})",
            waiting, request.name, request.server_type
        );

        let created = match self.cloud.create_host(&request).await {
            Ok(created) => created,
            Err(e) => {
                error!("创建主机失败: {}", e);
                self.metrics.record_host_creation_failure("create");
                return Err(ProvisioningFailure::Failed(e.to_string()));
            }
        };
        info!("云服务商已创建主机 {}，等待注册", created.provider_id);

        let result = self.wait_for_headroom(required_mb).await;
        match &result {
            Ok(()) => self
                .metrics
                .record_host_creation(started.elapsed().as_secs_f64()),
            Err(_) => {
                error!("新主机 {} 未在超时内完成注册", created.provider_id);
                self.metrics.record_host_creation_failure("timeout");
            }
        }
        result
    }

    async fn wait_for_headroom(&self, required_mb: i64) -> Result<(), ProvisioningFailure> {
        let started = Instant::now();
        let timeout = self.config.timeout();

        loop {
            match self.hosts.has_headroom(required_mb).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!("轮询主机余量失败: {}", e),
            }

            if started.elapsed() >= timeout {
                return Err(ProvisioningFailure::Timeout {
                    waited_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

fn failed(err: FleetError) -> ProvisioningFailure {
    ProvisioningFailure::Failed(err.to_string())
}

/// 新主机的 cloud-init 脚本：启动后回调注册接口上报地址和内存
pub fn bootstrap_script(callback_url: &str, token: Option<&str>) -> String {
    let auth_header = token
        .map(|t| format!(" -H 'Authorization: Bearer {t}'"))
        .unwrap_or_default();

    format!(
        r#"#!/bin/bash
set -uo pipefail
METADATA=http://169.254.169.254/hetzner/v1/metadata
ADDRESS=$(curl -fsS "$METADATA/public-ipv4" || hostname -I | awk '{{print $1}}')
PROVIDER_ID=$(curl -fsS "$METADATA/instance-id" || true)
RAM_TOTAL_MB=$(free -m | awk '/^Mem:/ {{print $2}}')
PAYLOAD="{{\"address\":\"$ADDRESS\",\"ram_total_mb\":$RAM_TOTAL_MB,\"hostname\":\"$(hostname)\",\"provider_id\":\"$PROVIDER_ID\"}}"
for attempt in $(seq 1 30); do
  if curl -fsS -X POST -H 'Content-Type: application/json'{auth_header} -d "$PAYLOAD" '{callback_url}'; then
    exit 0
  fi
  sleep 10
done
exit 1
"#
    )
}
