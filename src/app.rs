use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_api::create_app;
use fleet_core::{AppConfig, FleetResult};
use fleet_dispatcher::{FleetController, FleetDependencies};
use fleet_infrastructure::{
    init_prometheus_exporter, DatabaseManager, HttpCloudProvisioner, HttpCredentialRevoker,
    MetricsCollector, PostgresHostRepository, PostgresTaskAuditRepository,
    PostgresTenantRepository, RedisCacheManager, SshRemoteExecutor, StaticGatewayConfigSource,
    WebhookNotifier,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 主应用程序
pub struct Application {
    config: AppConfig,
    controller: Arc<FleetController>,
    database: DatabaseManager,
    instance_id: String,
}

impl Application {
    /// 连接存储、组装外部协作方并创建编排器
    pub async fn new(config: AppConfig) -> Result<Self> {
        let instance_id = instance_id();
        info!("初始化编排器实例: {}", instance_id);

        info!("连接数据库: {}", mask_database_url(&config.database.url));
        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        database.migrate().await.context("运行数据库迁移失败")?;
        info!("数据库连接成功");

        let cache = Arc::new(
            RedisCacheManager::new(&config.cache)
                .await
                .context("连接Redis失败")?,
        );

        if config.observability.metrics_enabled {
            init_prometheus_exporter(&config.observability.metrics_bind_address)?;
        }

        let pool = database.pool().clone();
        let deps = FleetDependencies {
            hosts: Arc::new(
                PostgresHostRepository::new(pool.clone())
                    .with_retry_attempts(config.capacity.reserve_retry_attempts),
            ),
            tenants: Arc::new(PostgresTenantRepository::new(pool.clone())),
            audit: Arc::new(PostgresTaskAuditRepository::new(pool)),
            cache: cache.clone(),
            lease: cache,
            executor: Arc::new(SshRemoteExecutor::new(&config.remote)),
            cloud: Arc::new(
                HttpCloudProvisioner::new(&config.cloud).context("创建云服务商客户端失败")?,
            ),
            notifier: Arc::new(
                WebhookNotifier::new(&config.notification).context("创建通知客户端失败")?,
            ),
            revoker: Arc::new(
                HttpCredentialRevoker::new(&config.notification)
                    .context("创建凭据吊销客户端失败")?,
            ),
            gateway: Arc::new(StaticGatewayConfigSource::new(&config.gateway)),
        };

        let controller = Arc::new(FleetController::new(
            &config,
            deps,
            Arc::new(MetricsCollector::new()),
            instance_id.clone(),
        ));

        Ok(Self {
            config,
            controller,
            database,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 启动周期任务和内部API，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动编排器组件");
        let mut handles = Vec::new();

        let controller = Arc::clone(&self.controller);
        handles.push(tokio::spawn(run_periodic(
            "休眠扫描",
            self.config.lifecycle.sleep_sweep_interval_seconds,
            shutdown_rx.resubscribe(),
            move || {
                let controller = Arc::clone(&controller);
                async move { controller.run_sleep_sweep().await }
            },
        )));

        let controller = Arc::clone(&self.controller);
        handles.push(tokio::spawn(run_periodic(
            "宽限期扫描",
            self.config.grace.sweep_interval_seconds,
            shutdown_rx.resubscribe(),
            move || {
                let controller = Arc::clone(&controller);
                async move { controller.run_grace_sweep().await }
            },
        )));

        let controller = Arc::clone(&self.controller);
        handles.push(tokio::spawn(run_periodic(
            "主机健康检查",
            self.config.lifecycle.host_health_interval_seconds,
            shutdown_rx.resubscribe(),
            move || {
                let controller = Arc::clone(&controller);
                async move { controller.run_host_health().await }
            },
        )));

        handles.push(tokio::spawn(run_decision_relay(
            Arc::clone(&self.controller),
            shutdown_rx.resubscribe(),
        )));

        if self.config.api.enabled {
            let app = create_app(Arc::clone(&self.controller), &self.config.api);
            let bind_address = self.config.api.bind_address.clone();
            let mut api_shutdown = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = api_shutdown.recv().await;
                    info!("内部API收到关闭信号");
                };
                if let Err(e) = fleet_api::serve(app, &bind_address, shutdown).await {
                    error!("内部API运行失败: {:#}", e);
                }
            }));
        } else {
            warn!("内部API已在配置中禁用");
        }

        let _ = shutdown_rx.recv().await;
        info!("编排器收到关闭信号");

        for handle in handles {
            let _ = handle.await;
        }

        self.database.close().await;
        info!("所有组件已停止");
        Ok(())
    }
}

/// 按固定间隔运行一个周期任务；租约被其他实例持有时本轮跳过
async fn run_periodic<F, Fut, R>(
    name: &'static str,
    interval_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
    job: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = FleetResult<Option<R>>>,
    R: Debug,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match job().await {
                    Ok(Some(report)) => info!("{}完成: {:?}", name, report),
                    Ok(None) => debug!("{}由其他实例执行，本轮跳过", name),
                    Err(e) => error!("{}失败: {}", name, e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("{}循环收到关闭信号", name);
                break;
            }
        }
    }
}

/// 把看门狗判定写入日志，供执行器侧的采集器消费
async fn run_decision_relay(
    controller: Arc<FleetController>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut decisions = controller.monitor().subscribe();

    loop {
        tokio::select! {
            received = decisions.recv() => match received {
                Ok(decision) => warn!(
                    task = %decision.key,
                    action = decision.action.as_str(),
                    "看门狗判定: {}",
                    decision.reason
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("看门狗判定积压，丢弃 {} 条", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => {
                info!("看门狗判定转发收到关闭信号");
                break;
            }
        }
    }
}

/// 实例标识，用作分布式租约的持有者
fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "fleet".to_string());
    format!("{}-{}", host, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// 屏蔽数据库URL中的敏感信息
fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_mask_database_url() {
        assert_eq!(
            mask_database_url("postgresql://fleet:secret@db:5432/fleet"),
            "postgresql://fleet:***@db:5432/fleet"
        );
        assert_eq!(
            mask_database_url("postgresql://localhost/fleet"),
            "postgresql://localhost/fleet"
        );
    }

    #[test]
    fn test_instance_ids_are_unique() {
        assert_ne!(instance_id(), instance_id());
    }

    #[tokio::test]
    async fn test_periodic_job_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = tokio::spawn(run_periodic("测试任务", 1, rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, fleet_core::FleetError>(Some(()))
            }
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        // 第一次 tick 立即触发
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
