#![allow(dead_code)]

use std::sync::Arc;

use fleet_core::{
    models::{Tenant, WorkerHost},
    AppConfig,
};
use fleet_dispatcher::{FleetController, FleetDependencies};
use fleet_infrastructure::MetricsCollector;
use fleet_testing_utils::{
    FakeCloudProvisioner, FakeCredentialRevoker, FakeGatewayConfigSource, FakeRemoteExecutor,
    HostBuilder, InMemoryCache, InMemoryFleetStore, MockTaskAuditRepository, RecordingNotifier,
    TestEnv,
};

/// 用内存实现组装的编排器
pub struct Harness {
    pub store: InMemoryFleetStore,
    pub cache: InMemoryCache,
    pub remote: FakeRemoteExecutor,
    pub cloud: FakeCloudProvisioner,
    pub notifier: RecordingNotifier,
    pub revoker: FakeCredentialRevoker,
    pub audit: MockTaskAuditRepository,
    pub config: AppConfig,
    pub controller: Arc<FleetController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TestEnv::fast_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::build(config, |_| FakeCloudProvisioner::new())
    }

    /// `cloud` 拿到共享存储，便于模拟新主机回调注册
    pub fn build<F>(config: AppConfig, cloud: F) -> Self
    where
        F: FnOnce(&InMemoryFleetStore) -> FakeCloudProvisioner,
    {
        let store = InMemoryFleetStore::new();
        let cache = InMemoryCache::new();
        let remote = FakeRemoteExecutor::new();
        let cloud = cloud(&store);
        let notifier = RecordingNotifier::new();
        let revoker = FakeCredentialRevoker::new();
        let audit = MockTaskAuditRepository::new();

        let deps = FleetDependencies {
            hosts: Arc::new(store.clone()),
            tenants: Arc::new(store.clone()),
            audit: Arc::new(audit.clone()),
            cache: Arc::new(cache.clone()),
            lease: Arc::new(cache.clone()),
            executor: Arc::new(remote.clone()),
            cloud: Arc::new(cloud.clone()),
            notifier: Arc::new(notifier.clone()),
            revoker: Arc::new(revoker.clone()),
            gateway: Arc::new(FakeGatewayConfigSource),
        };
        let controller = Arc::new(FleetController::new(
            &config,
            deps,
            Arc::new(MetricsCollector::new()),
            "test-instance".to_string(),
        ));

        Self {
            store,
            cache,
            remote,
            cloud,
            notifier,
            revoker,
            audit,
            config,
            controller,
        }
    }

    pub fn add_host(&self, id: &str, total_mb: i64, used_mb: i64) -> WorkerHost {
        let host = HostBuilder::new().with_id(id).with_ram(total_mb, used_mb).build();
        self.store.insert_host(host.clone());
        host
    }

    pub fn add_tenant(&self, tenant: Tenant) -> Tenant {
        self.store.insert_tenant(tenant.clone());
        tenant
    }

    pub fn ram_used(&self, host_id: &str) -> i64 {
        self.store
            .host(host_id)
            .map(|host| host.ram_used_mb)
            .unwrap_or_default()
    }

    pub fn tenant(&self, tenant_id: &str) -> Tenant {
        self.store.tenant(tenant_id).expect("tenant exists")
    }
}
