#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use fleet_api::create_app;
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
use tokio::net::TcpListener;

pub const TEST_TOKEN: &str = "internal-test-token-0001";

/// 路由背后的内存依赖，测试用来预置和检查状态
pub struct TestParts {
    pub store: InMemoryFleetStore,
    pub remote: FakeRemoteExecutor,
    pub notifier: RecordingNotifier,
    pub audit: MockTaskAuditRepository,
}

/// 构建不监听端口的路由，供 `oneshot` 测试直接调用
pub fn build_app(config: &AppConfig) -> (Router, TestParts) {
    let store = InMemoryFleetStore::new();
    let cache = InMemoryCache::new();
    let remote = FakeRemoteExecutor::new();
    let notifier = RecordingNotifier::new();
    let audit = MockTaskAuditRepository::new();

    let deps = FleetDependencies {
        hosts: Arc::new(store.clone()),
        tenants: Arc::new(store.clone()),
        audit: Arc::new(audit.clone()),
        cache: Arc::new(cache.clone()),
        lease: Arc::new(cache),
        executor: Arc::new(remote.clone()),
        cloud: Arc::new(FakeCloudProvisioner::new()),
        notifier: Arc::new(notifier.clone()),
        revoker: Arc::new(FakeCredentialRevoker::new()),
        gateway: Arc::new(FakeGatewayConfigSource),
    };
    let controller = Arc::new(FleetController::new(
        config,
        deps,
        Arc::new(MetricsCollector::new()),
        "api-test".to_string(),
    ));

    let parts = TestParts {
        store,
        remote,
        notifier,
        audit,
    };
    (create_app(controller, &config.api), parts)
}

/// 在随机端口上启动的内部API，依赖全部使用内存实现
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: InMemoryFleetStore,
    pub remote: FakeRemoteExecutor,
    pub notifier: RecordingNotifier,
    pub audit: MockTaskAuditRepository,
}

impl TestApp {
    pub async fn spawn() -> TestApp {
        let mut config = TestEnv::fast_config();
        config.api.internal_token = Some(TEST_TOKEN.to_string());
        Self::spawn_with(config).await
    }

    pub async fn spawn_with(config: AppConfig) -> TestApp {
        let (app, parts) = build_app(&config);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestApp {
            address: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            store: parts.store,
            remote: parts.remote,
            notifier: parts.notifier,
            audit: parts.audit,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(TEST_TOKEN)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(TEST_TOKEN)
    }

    pub fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.put(self.url(path)).bearer_auth(TEST_TOKEN)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(TEST_TOKEN)
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
}
