use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use fleet_core::{
    models::{HostRegistration, HostStatus, PlanRamTable, PlanTier, RegisteredHost, Tenant, WorkerHost},
    traits::{HostRemoval, HostRepository, TenantReservation},
    FleetError, FleetResult,
};
use fleet_infrastructure::MetricsCollector;

/// 主机容量登记处
///
/// `ram_used_mb` 是预订量而不是实测值：它等于绑定到主机、处于预订状态的租户的
/// 套餐内存之和。所有修改都经过存储层的原子条件操作，进程内不持有任何锁。
pub struct CapacityRegistry {
    hosts: Arc<dyn HostRepository>,
    plans: PlanRamTable,
    metrics: Arc<MetricsCollector>,
}

impl CapacityRegistry {
    pub fn new(
        hosts: Arc<dyn HostRepository>,
        plans: PlanRamTable,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            hosts,
            plans,
            metrics,
        }
    }

    pub fn plans(&self) -> &PlanRamTable {
        &self.plans
    }

    pub fn ram_for(&self, plan: PlanTier) -> i64 {
        self.plans.ram_for(plan)
    }

    /// 按地址幂等注册主机
    pub async fn register_host(&self, registration: &HostRegistration) -> FleetResult<RegisteredHost> {
        if registration.address.trim().is_empty() {
            return Err(FleetError::InvalidInput("主机地址不能为空".to_string()));
        }
        if registration.ram_total_mb <= 0 {
            return Err(FleetError::InvalidInput(format!(
                "主机内存必须大于0: {}",
                registration.ram_total_mb
            )));
        }

        let registered = self.hosts.register(registration).await?;
        if registered.is_new {
            info!(
                host_id = %registered.host.id,
                address = %registered.host.address,
                ram_total_mb = registered.host.ram_total_mb,
                "新主机注册"
            );
        } else {
            debug!("主机 {} 重新注册", registered.host.address);
        }
        Ok(registered)
    }

    /// 原子预订内存，没有主机有余量时返回 `CapacityExhausted`
    pub async fn reserve(&self, required_mb: i64) -> FleetResult<WorkerHost> {
        match self.hosts.reserve(required_mb).await? {
            Some(host) => {
                debug!(
                    host_id = %host.id,
                    required_mb,
                    ram_used_mb = host.ram_used_mb,
                    "容量预订成功"
                );
                self.metrics.record_reservation(&host.id, required_mb);
                Ok(host)
            }
            None => {
                self.metrics.record_capacity_exhausted(required_mb);
                Err(FleetError::CapacityExhausted { required_mb })
            }
        }
    }

    /// 为待分配租户预订套餐内存，并在同一事务中完成 pending → provisioning
    pub async fn reserve_for_tenant(&self, tenant: &Tenant) -> FleetResult<TenantReservation> {
        let required_mb = self.ram_for(tenant.plan_tier);
        let reservation = self
            .hosts
            .reserve_for_tenant(&tenant.id, required_mb, &tenant.container())
            .await?;

        match &reservation {
            TenantReservation::Assigned { host, .. } => {
                info!(
                    "租户 {} 分配到主机 {} ({}MB，已预订 {}/{}MB)",
                    tenant.id, host.id, required_mb, host.ram_used_mb, host.ram_total_mb
                );
                self.metrics.record_reservation(&host.id, required_mb);
            }
            TenantReservation::Exhausted => {
                self.metrics.record_capacity_exhausted(required_mb);
            }
            TenantReservation::NotPending(status) => {
                debug!("租户 {} 已不处于 pending ({})，跳过预订", tenant.id, status);
            }
        }
        Ok(reservation)
    }

    /// 从最新快照重新计算主机预订量，修复漂移
    pub async fn recompute(&self, host_id: &str) -> FleetResult<Option<i64>> {
        let recomputed = self.hosts.recompute_ram(host_id, &self.plans).await?;
        match recomputed {
            Some(ram_used_mb) => {
                debug!("主机 {} 预订量重新计算为 {}MB", host_id, ram_used_mb);
                self.metrics.record_recompute();
            }
            None => warn!("重新计算预订量时主机 {} 不存在", host_id),
        }
        Ok(recomputed)
    }

    /// 只读检查，不预订也不触发创建主机
    pub async fn has_headroom(&self, required_mb: i64) -> FleetResult<bool> {
        self.hosts.has_headroom(required_mb).await
    }

    pub async fn get_host(&self, host_id: &str) -> FleetResult<WorkerHost> {
        self.hosts
            .get_by_id(host_id)
            .await?
            .ok_or_else(|| FleetError::HostNotFound {
                id: host_id.to_string(),
            })
    }

    pub async fn list_hosts(&self) -> FleetResult<Vec<WorkerHost>> {
        self.hosts.list().await
    }

    pub async fn set_host_status(&self, host_id: &str, status: HostStatus) -> FleetResult<WorkerHost> {
        let host = self
            .hosts
            .set_status(host_id, status)
            .await?
            .ok_or_else(|| FleetError::HostNotFound {
                id: host_id.to_string(),
            })?;
        info!("主机 {} 状态更新为 {}", host_id, status);
        Ok(host)
    }

    /// 条件删除主机，仍有未清除租户绑定时返回 `HostInUse`
    pub async fn remove_host(&self, host_id: &str) -> FleetResult<WorkerHost> {
        match self.hosts.remove_if_unassigned(host_id).await? {
            HostRemoval::Removed(host) => {
                info!("主机 {} ({}) 已移除", host.id, host.address);
                Ok(host)
            }
            HostRemoval::InUse { assigned } => Err(FleetError::HostInUse {
                id: host_id.to_string(),
                assigned,
            }),
            HostRemoval::NotFound => Err(FleetError::HostNotFound {
                id: host_id.to_string(),
            }),
        }
    }

    /// 汇总集群容量并更新指标
    pub async fn refresh_fleet_metrics(&self) -> FleetResult<FleetCapacity> {
        let hosts = self.hosts.list().await?;
        let capacity = FleetCapacity::from_hosts(&hosts);
        self.metrics.update_fleet_capacity(
            capacity.active_hosts,
            capacity.ram_total_mb,
            capacity.ram_booked_mb,
        );
        Ok(capacity)
    }
}

/// 集群容量汇总（只统计 active 主机）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetCapacity {
    pub active_hosts: usize,
    pub ram_total_mb: i64,
    pub ram_booked_mb: i64,
}

impl FleetCapacity {
    pub fn from_hosts(hosts: &[WorkerHost]) -> Self {
        hosts
            .iter()
            .filter(|host| host.status == HostStatus::Active)
            .fold(Self::default(), |mut acc, host| {
                acc.active_hosts += 1;
                acc.ram_total_mb += host.ram_total_mb;
                acc.ram_booked_mb += host.ram_used_mb;
                acc
            })
    }

    pub fn headroom_mb(&self) -> i64 {
        self.ram_total_mb - self.ram_booked_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_testing_utils::HostBuilder;

    #[test]
    fn test_fleet_capacity_ignores_inactive_hosts() {
        let hosts = vec![
            HostBuilder::new().with_id("a").with_ram(8192, 2048).build(),
            HostBuilder::new().with_id("b").with_ram(4096, 4096).build(),
            HostBuilder::new()
                .with_id("c")
                .with_ram(8192, 0)
                .with_status(HostStatus::Draining)
                .build(),
        ];

        let capacity = FleetCapacity::from_hosts(&hosts);
        assert_eq!(capacity.active_hosts, 2);
        assert_eq!(capacity.ram_total_mb, 12288);
        assert_eq!(capacity.headroom_mb(), 6144);
    }
}
