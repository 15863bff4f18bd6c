use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use fleet_core::{
    models::{HostStatus, WorkerHost},
    traits::{CacheKeys, HostRepository, LeaseService, RemoteExecutor},
    FleetResult,
};

use crate::capacity_registry::{CapacityRegistry, FleetCapacity};
use crate::commands::ContainerCommands;
use crate::lease::run_exclusive;

/// 一轮主机健康检查的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostHealthReport {
    pub probed: usize,
    pub marked_offline: usize,
    pub recovered: usize,
    pub recompute_failures: usize,
    pub fleet: FleetCapacity,
    /// 集群是否还能容纳最大的套餐
    pub has_headroom: bool,
}

/// 主机健康检查
///
/// 探测每台主机的远程通道，不可达的主机标记为 offline，恢复的主机回到 active；
/// 实测内存只记录用于诊断，不参与准入。每轮都重新计算所有主机的预订量。
/// 容量检查是只读的，不会触发创建主机。
pub struct HostHealthMonitor {
    registry: Arc<CapacityRegistry>,
    hosts: Arc<dyn HostRepository>,
    executor: Arc<dyn RemoteExecutor>,
    lease: Arc<dyn LeaseService>,
    interval: Duration,
    probe_timeout: Duration,
    instance_id: String,
}

impl HostHealthMonitor {
    pub fn new(
        registry: Arc<CapacityRegistry>,
        hosts: Arc<dyn HostRepository>,
        executor: Arc<dyn RemoteExecutor>,
        lease: Arc<dyn LeaseService>,
        interval: Duration,
        probe_timeout: Duration,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            hosts,
            executor,
            lease,
            interval,
            probe_timeout,
            instance_id,
        }
    }

    pub async fn run_check(&self) -> FleetResult<Option<HostHealthReport>> {
        run_exclusive(
            self.lease.as_ref(),
            CacheKeys::HOST_HEALTH_LEASE,
            &self.instance_id,
            self.interval,
            self.check_once(),
        )
        .await
    }

    pub async fn check_once(&self) -> FleetResult<HostHealthReport> {
        let hosts = self.registry.list_hosts().await?;
        let mut report = HostHealthReport {
            probed: hosts.len(),
            ..Default::default()
        };

        for host in &hosts {
            match self.probe(host).await {
                Ok(ProbeOutcome::MarkedOffline) => report.marked_offline += 1,
                Ok(ProbeOutcome::Recovered) => report.recovered += 1,
                Ok(ProbeOutcome::Unchanged) => {}
                Err(e) => error!("记录主机 {} 探测结果失败: {}", host.id, e),
            }

            if let Err(e) = self.registry.recompute(&host.id).await {
                error!("主机 {} 预订量重新计算失败: {}", host.id, e);
                report.recompute_failures += 1;
            }
        }

        report.fleet = self.registry.refresh_fleet_metrics().await?;
        let largest_mb = self.registry.plans().largest_mb();
        report.has_headroom = self.registry.has_headroom(largest_mb).await?;
        if !report.has_headroom {
            warn!(
                "集群没有能容纳 {}MB 套餐的主机 (活跃主机 {} 台，已预订 {}/{}MB)",
                largest_mb,
                report.fleet.active_hosts,
                report.fleet.ram_booked_mb,
                report.fleet.ram_total_mb
            );
        }

        if report.marked_offline > 0 || report.recovered > 0 {
            info!(
                "主机健康检查完成: {} 台离线，{} 台恢复",
                report.marked_offline, report.recovered
            );
        }
        Ok(report)
    }

    async fn probe(&self, host: &WorkerHost) -> FleetResult<ProbeOutcome> {
        let result = self
            .executor
            .run(&host.address, ContainerCommands::memory_usage(), self.probe_timeout)
            .await;

        match result {
            Ok(output) => {
                let measured = if output.is_success() {
                    ContainerCommands::parse_memory_usage(&output.stdout)
                } else {
                    None
                };
                self.hosts.record_probe(&host.id, measured, Utc::now()).await?;
                debug!(
                    "主机 {} 可达，实测内存 {:?}MB，预订 {}MB",
                    host.id, measured, host.ram_used_mb
                );

                if host.status == HostStatus::Offline {
                    self.registry.set_host_status(&host.id, HostStatus::Active).await?;
                    info!("主机 {} 恢复可达，重新标记为 active", host.id);
                    return Ok(ProbeOutcome::Recovered);
                }
                Ok(ProbeOutcome::Unchanged)
            }
            Err(e) => {
                if host.status == HostStatus::Active {
                    warn!("主机 {} ({}) 不可达，标记为 offline: {}", host.id, host.address, e);
                    self.registry.set_host_status(&host.id, HostStatus::Offline).await?;
                    return Ok(ProbeOutcome::MarkedOffline);
                }
                debug!("主机 {} 仍不可达: {}", host.id, e);
                Ok(ProbeOutcome::Unchanged)
            }
        }
    }
}

enum ProbeOutcome {
    MarkedOffline,
    Recovered,
    Unchanged,
}
