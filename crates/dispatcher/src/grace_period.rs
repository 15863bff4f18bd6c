use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use fleet_core::{
    config::GraceConfig,
    models::{BillingEvent, NotificationKind, StatusTransition, Tenant, TenantStatus, UpdateValue},
    traits::{CacheKeys, CredentialRevoker, LeaseService, Notifier, TenantRepository},
    FleetResult,
};
use fleet_infrastructure::MetricsCollector;

use crate::lease::run_exclusive;
use crate::lifecycle::ContainerLifecycleManager;

/// 宽限期扫描对单个租户的处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceStage {
    Pause,
    Cancel,
    Purge,
}

/// 根据时间窗口判断租户当前应进入的阶段
pub fn grace_stage(tenant: &Tenant, now: DateTime<Utc>, config: &GraceConfig) -> Option<GraceStage> {
    match tenant.status {
        TenantStatus::GracePeriod => {
            let end = tenant.grace_period_end?;
            if now >= end {
                Some(GraceStage::Cancel)
            } else if now >= end - config.pause_before_end() {
                Some(GraceStage::Pause)
            } else {
                None
            }
        }
        TenantStatus::Paused => {
            let end = tenant.grace_period_end?;
            (now >= end).then_some(GraceStage::Cancel)
        }
        TenantStatus::Cancelled => {
            let cancelled_at = tenant.cancelled_at?;
            (now - cancelled_at >= config.purge_after_cancel()).then_some(GraceStage::Purge)
        }
        _ => None,
    }
}

/// 一轮宽限期扫描的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraceSweepReport {
    pub paused: usize,
    pub cancelled: usize,
    pub purged: usize,
    pub failed: usize,
}

/// 欠费租户的分阶段暂停、取消与清除
pub struct GracePeriodScheduler {
    tenants: Arc<dyn TenantRepository>,
    lifecycle: Arc<ContainerLifecycleManager>,
    notifier: Arc<dyn Notifier>,
    revoker: Arc<dyn CredentialRevoker>,
    lease: Arc<dyn LeaseService>,
    config: GraceConfig,
    instance_id: String,
    metrics: Arc<MetricsCollector>,
}

impl GracePeriodScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        lifecycle: Arc<ContainerLifecycleManager>,
        notifier: Arc<dyn Notifier>,
        revoker: Arc<dyn CredentialRevoker>,
        lease: Arc<dyn LeaseService>,
        config: GraceConfig,
        instance_id: String,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            tenants,
            lifecycle,
            notifier,
            revoker,
            lease,
            config,
            instance_id,
            metrics,
        }
    }

    pub async fn handle_billing_event(&self, event: &BillingEvent) -> FleetResult<bool> {
        match event {
            BillingEvent::PaymentFailed { tenant_id } => self.on_payment_failed(tenant_id).await,
            BillingEvent::PaymentRecovered { tenant_id } => {
                self.on_payment_recovered(tenant_id).await
            }
            BillingEvent::SubscriptionCancelled { tenant_id } => self
                .on_subscription_cancelled(tenant_id)
                .await
                .map(|tenant| tenant.status == TenantStatus::Cancelled),
        }
    }

    /// 付款失败：进入宽限期，服务继续运行
    ///
    /// 重复事件不产生任何效果。休眠中的租户先唤醒再进入宽限期，唤醒失败时
    /// 直接暂停。
    pub async fn on_payment_failed(&self, tenant_id: &str) -> FleetResult<bool> {
        let end = Utc::now() + self.config.grace_period();
        let enter_grace = StatusTransition::new(
            tenant_id,
            &[
                TenantStatus::Active,
                TenantStatus::Starting,
                TenantStatus::Provisioning,
            ],
            TenantStatus::GracePeriod,
        )
        .with_grace_period_end(UpdateValue::Set(end));

        if let Some(tenant) = self.tenants.transition(&enter_grace).await? {
            self.entered_grace(&tenant).await;
            return Ok(true);
        }

        let tenant = self.lifecycle.get_tenant(tenant_id).await?;
        if tenant.status != TenantStatus::Sleeping {
            debug!("租户 {} 当前为 {}，忽略付款失败事件", tenant_id, tenant.status);
            return Ok(false);
        }

        match self.lifecycle.wake(tenant_id).await {
            Ok(_) => match self.tenants.transition(&enter_grace).await? {
                Some(tenant) => {
                    self.entered_grace(&tenant).await;
                    Ok(true)
                }
                None => Ok(false),
            },
            Err(e) => {
                warn!("租户 {} 唤醒失败，直接暂停服务: {}", tenant_id, e);
                let pause = StatusTransition::new(tenant_id, &[TenantStatus::Sleeping], TenantStatus::Paused)
                    .with_grace_period_end(UpdateValue::Set(end));
                match self.tenants.transition(&pause).await? {
                    Some(tenant) => {
                        self.lifecycle.invalidate_status(tenant_id).await;
                        self.notify(&tenant, NotificationKind::PaymentFailed).await;
                        self.metrics.record_grace_transition("paused");
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    async fn entered_grace(&self, tenant: &Tenant) {
        info!(
            "租户 {} 付款失败，进入宽限期至 {:?}",
            tenant.id, tenant.grace_period_end
        );
        self.lifecycle.invalidate_status(&tenant.id).await;
        self.notify(tenant, NotificationKind::PaymentFailed).await;
        self.metrics.record_grace_transition("grace_period");
    }

    /// 付款恢复：宽限期内回到 active，已暂停的回到 sleeping 等待流量唤醒
    pub async fn on_payment_recovered(&self, tenant_id: &str) -> FleetResult<bool> {
        let resume = StatusTransition::new(tenant_id, &[TenantStatus::GracePeriod], TenantStatus::Active)
            .with_grace_period_end(UpdateValue::Unset);
        let unpause = StatusTransition::new(tenant_id, &[TenantStatus::Paused], TenantStatus::Sleeping)
            .with_grace_period_end(UpdateValue::Unset);

        let recovered = match self.tenants.transition(&resume).await? {
            Some(tenant) => Some(tenant),
            None => self.tenants.transition(&unpause).await?,
        };

        match recovered {
            Some(tenant) => {
                info!("租户 {} 付款恢复，状态回到 {}", tenant_id, tenant.status);
                self.lifecycle.invalidate_status(tenant_id).await;
                self.notify(&tenant, NotificationKind::PaymentRecovered).await;
                self.metrics.record_grace_transition("recovered");
                Ok(true)
            }
            None => {
                // 确认租户存在
                self.lifecycle.get_tenant(tenant_id).await?;
                Ok(false)
            }
        }
    }

    pub async fn on_subscription_cancelled(&self, tenant_id: &str) -> FleetResult<Tenant> {
        let before = self.lifecycle.get_tenant(tenant_id).await?;
        let tenant = self.lifecycle.cancel(tenant_id).await?;
        if !before.status.is_terminal() && tenant.status == TenantStatus::Cancelled {
            self.notify(&tenant, NotificationKind::ServiceCancelled).await;
            self.metrics.record_grace_transition("cancelled");
        }
        Ok(tenant)
    }

    /// 执行宽限期扫描（持有分布式租约时）
    pub async fn run_sweep(&self) -> FleetResult<Option<GraceSweepReport>> {
        let ttl = Duration::from_secs(self.config.sweep_interval_seconds);
        run_exclusive(
            self.lease.as_ref(),
            CacheKeys::GRACE_SWEEP_LEASE,
            &self.instance_id,
            ttl,
            self.sweep_once(),
        )
        .await
    }

    /// 一轮宽限期扫描；每一步都是条件转换，重复执行不会重复通知
    pub async fn sweep_once(&self) -> FleetResult<GraceSweepReport> {
        let now = Utc::now();
        let candidates = self
            .tenants
            .list_by_status(&[
                TenantStatus::GracePeriod,
                TenantStatus::Paused,
                TenantStatus::Cancelled,
            ])
            .await?;

        let mut report = GraceSweepReport::default();
        for tenant in &candidates {
            let Some(stage) = grace_stage(tenant, now, &self.config) else {
                continue;
            };

            let result = match stage {
                GraceStage::Pause => self.pause(tenant).await,
                GraceStage::Cancel => self.cancel_expired(tenant, now).await,
                GraceStage::Purge => self.purge(tenant).await,
            };

            match result {
                Ok(true) => match stage {
                    GraceStage::Pause => report.paused += 1,
                    GraceStage::Cancel => report.cancelled += 1,
                    GraceStage::Purge => report.purged += 1,
                },
                Ok(false) => {}
                Err(e) => {
                    error!("租户 {} 宽限期处理 {:?} 失败，下轮重试: {}", tenant.id, stage, e);
                    report.failed += 1;
                }
            }
        }

        if report != GraceSweepReport::default() {
            info!(
                "宽限期扫描完成: 暂停 {}，取消 {}，清除 {}，失败 {}",
                report.paused, report.cancelled, report.purged, report.failed
            );
        }
        Ok(report)
    }

    async fn pause(&self, tenant: &Tenant) -> FleetResult<bool> {
        let transition =
            StatusTransition::new(&tenant.id, &[TenantStatus::GracePeriod], TenantStatus::Paused);
        let Some(paused) = self.lifecycle.stop_and_transition(tenant, &transition).await? else {
            return Ok(false);
        };

        info!("租户 {} 宽限期即将结束，服务已暂停", tenant.id);
        self.notify(&paused, NotificationKind::ServicePaused).await;
        self.metrics.record_grace_transition("paused");
        Ok(true)
    }

    async fn cancel_expired(&self, tenant: &Tenant, now: DateTime<Utc>) -> FleetResult<bool> {
        let transition = StatusTransition::new(
            &tenant.id,
            &[TenantStatus::GracePeriod, TenantStatus::Paused],
            TenantStatus::Cancelled,
        )
        .with_cancelled_at(UpdateValue::Set(now));
        let Some(cancelled) = self.lifecycle.stop_and_transition(tenant, &transition).await? else {
            return Ok(false);
        };

        info!("租户 {} 宽限期结束，订阅已取消", tenant.id);
        self.notify(&cancelled, NotificationKind::ServiceCancelled).await;
        self.metrics.record_grace_transition("cancelled");
        Ok(true)
    }

    /// 不可逆清除：删除容器和数据、吊销外部凭据，最后 cancelled → purged
    async fn purge(&self, tenant: &Tenant) -> FleetResult<bool> {
        self.lifecycle.purge_container(tenant).await?;
        self.revoker.revoke(&tenant.id).await?;

        let transition =
            StatusTransition::new(&tenant.id, &[TenantStatus::Cancelled], TenantStatus::Purged);
        let Some(purged) = self.tenants.transition(&transition).await? else {
            return Ok(false);
        };

        info!("租户 {} 数据已清除", tenant.id);
        self.notify(&purged, NotificationKind::DataPurged).await;
        self.metrics.record_grace_transition("purged");
        Ok(true)
    }

    /// 通知失败只记录日志，状态已经提交
    async fn notify(&self, tenant: &Tenant, kind: NotificationKind) {
        let context = json!({
            "tenant_id": tenant.id,
            "status": tenant.status.as_str(),
            "grace_period_end": tenant.grace_period_end,
            "cancelled_at": tenant.cancelled_at,
        });
        if let Err(e) = self.notifier.send(&tenant.contact, kind, &context).await {
            warn!("发送 {} 通知给租户 {} 失败: {}", kind.as_str(), tenant.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use fleet_testing_utils::TenantBuilder;

    fn in_grace(ends_in: ChronoDuration) -> Tenant {
        TenantBuilder::new()
            .with_status(TenantStatus::GracePeriod)
            .on_host("h1")
            .with_grace_period_end(Utc::now() + ends_in)
            .build()
    }

    #[test]
    fn test_grace_stage_boundaries() {
        let config = GraceConfig::default();
        let now = Utc::now();

        let early = in_grace(ChronoDuration::days(3) + ChronoDuration::hours(1));
        assert_eq!(grace_stage(&early, now, &config), None);

        let pausing = in_grace(ChronoDuration::days(3) - ChronoDuration::hours(1));
        assert_eq!(grace_stage(&pausing, now, &config), Some(GraceStage::Pause));

        let expired = in_grace(-ChronoDuration::minutes(1));
        assert_eq!(grace_stage(&expired, now, &config), Some(GraceStage::Cancel));
    }

    #[test]
    fn test_paused_cancels_only_after_end() {
        let config = GraceConfig::default();
        let now = Utc::now();
        let mut paused = in_grace(ChronoDuration::hours(2));
        paused.status = TenantStatus::Paused;
        assert_eq!(grace_stage(&paused, now, &config), None);

        paused.grace_period_end = Some(now - ChronoDuration::seconds(1));
        assert_eq!(grace_stage(&paused, now, &config), Some(GraceStage::Cancel));
    }

    #[test]
    fn test_purge_after_thirty_days() {
        let config = GraceConfig::default();
        let now = Utc::now();
        let recent = TenantBuilder::new()
            .with_status(TenantStatus::Cancelled)
            .with_cancelled_at(now - ChronoDuration::days(29))
            .build();
        assert_eq!(grace_stage(&recent, now, &config), None);

        let old = TenantBuilder::new()
            .with_status(TenantStatus::Cancelled)
            .with_cancelled_at(now - ChronoDuration::days(30))
            .build();
        assert_eq!(grace_stage(&old, now, &config), Some(GraceStage::Purge));
    }

    #[test]
    fn test_other_states_ignored() {
        let config = GraceConfig::default();
        let active = TenantBuilder::new().with_status(TenantStatus::Active).build();
        assert_eq!(grace_stage(&active, Utc::now(), &config), None);
    }
}
