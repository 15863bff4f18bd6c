//! In-memory implementations of the repository and collaborator traits
//!
//! The host and tenant repositories share one mutex so every conditional
//! operation is atomic, matching the row-lock semantics of the Postgres
//! implementation closely enough for concurrency tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::models::{
    CommandOutput, HostRegistration, HostStatus, NewTenant, NotificationKind, PlanRamTable,
    RegisteredHost, StatusTransition, TaskAuditRecord, Tenant, TenantStatus, WorkerHost,
    pick_fullest_fit,
};
use fleet_core::traits::{
    CacheService, CloudProvisioner, CreatedHost, CredentialRevoker, GatewayConfigSource,
    HostCreateRequest, HostRemoval, HostRepository, LeaseService, Notifier, RemoteExecutor,
    TaskAuditRepository, TenantRepository, TenantReservation, WakeReservation,
};
use fleet_core::{FleetError, FleetResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct FleetState {
    hosts: HashMap<String, WorkerHost>,
    tenants: HashMap<String, Tenant>,
}

/// Host and tenant store backed by a single mutex
#[derive(Debug, Clone, Default)]
pub struct InMemoryFleetStore {
    state: Arc<Mutex<FleetState>>,
}

impl InMemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_host(&self, host: WorkerHost) {
        self.state
            .lock()
            .unwrap()
            .hosts
            .insert(host.id.clone(), host);
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.state
            .lock()
            .unwrap()
            .tenants
            .insert(tenant.id.clone(), tenant);
    }

    pub fn host(&self, host_id: &str) -> Option<WorkerHost> {
        self.state.lock().unwrap().hosts.get(host_id).cloned()
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.state.lock().unwrap().tenants.get(tenant_id).cloned()
    }

    pub fn hosts(&self) -> Vec<WorkerHost> {
        self.state.lock().unwrap().hosts.values().cloned().collect()
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        self.state.lock().unwrap().tenants.values().cloned().collect()
    }

    pub fn host_count(&self) -> usize {
        self.state.lock().unwrap().hosts.len()
    }

    /// Directly overwrite booked memory, used to simulate drift
    pub fn set_ram_used(&self, host_id: &str, ram_used_mb: i64) {
        if let Some(host) = self.state.lock().unwrap().hosts.get_mut(host_id) {
            host.ram_used_mb = ram_used_mb;
        }
    }

    pub fn update_tenant<F>(&self, tenant_id: &str, update: F)
    where
        F: FnOnce(&mut Tenant),
    {
        if let Some(tenant) = self.state.lock().unwrap().tenants.get_mut(tenant_id) {
            update(tenant);
        }
    }
}

fn pick_host_id(hosts: &HashMap<String, WorkerHost>, required_mb: i64) -> Option<String> {
    let candidates: Vec<WorkerHost> = hosts.values().cloned().collect();
    pick_fullest_fit(&candidates, required_mb).map(|host| host.id.clone())
}

#[async_trait]
impl HostRepository for InMemoryFleetStore {
    async fn register(&self, registration: &HostRegistration) -> FleetResult<RegisteredHost> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        if let Some(existing) = state
            .hosts
            .values_mut()
            .find(|host| host.address == registration.address)
        {
            existing.ram_total_mb = registration.ram_total_mb;
            existing.hostname = registration.hostname.clone();
            existing.last_seen_at = now;
            if registration.provider_id.is_some() {
                existing.provider_id = registration.provider_id.clone();
            }
            if existing.status == HostStatus::Offline {
                existing.status = HostStatus::Active;
            }
            return Ok(RegisteredHost {
                host: existing.clone(),
                is_new: false,
            });
        }

        let host = WorkerHost::new(registration.clone());
        state.hosts.insert(host.id.clone(), host.clone());
        Ok(RegisteredHost { host, is_new: true })
    }

    async fn get_by_id(&self, host_id: &str) -> FleetResult<Option<WorkerHost>> {
        Ok(self.host(host_id))
    }

    async fn list(&self) -> FleetResult<Vec<WorkerHost>> {
        let mut hosts = self.hosts();
        hosts.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(hosts)
    }

    async fn reserve(&self, required_mb: i64) -> FleetResult<Option<WorkerHost>> {
        let mut state = self.state.lock().unwrap();
        let Some(host_id) = pick_host_id(&state.hosts, required_mb) else {
            return Ok(None);
        };
        let host = state
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| FleetError::HostNotFound { id: host_id.clone() })?;
        host.ram_used_mb += required_mb;
        Ok(Some(host.clone()))
    }

    async fn reserve_for_tenant(
        &self,
        tenant_id: &str,
        required_mb: i64,
        container_name: &str,
    ) -> FleetResult<TenantReservation> {
        let mut state = self.state.lock().unwrap();
        let status = state
            .tenants
            .get(tenant_id)
            .map(|tenant| tenant.status)
            .ok_or_else(|| FleetError::TenantNotFound {
                id: tenant_id.to_string(),
            })?;
        if status != TenantStatus::Pending {
            return Ok(TenantReservation::NotPending(status));
        }

        let Some(host_id) = pick_host_id(&state.hosts, required_mb) else {
            return Ok(TenantReservation::Exhausted);
        };

        let now = Utc::now();
        let host = match state.hosts.get_mut(&host_id) {
            Some(host) => {
                host.ram_used_mb += required_mb;
                host.clone()
            }
            None => return Ok(TenantReservation::Exhausted),
        };
        let tenant = match state.tenants.get_mut(tenant_id) {
            Some(tenant) => {
                tenant.status = TenantStatus::Provisioning;
                tenant.assigned_host_id = Some(host_id);
                tenant.container_name = Some(container_name.to_string());
                tenant.updated_at = now;
                tenant.clone()
            }
            None => {
                return Err(FleetError::TenantNotFound {
                    id: tenant_id.to_string(),
                })
            }
        };

        Ok(TenantReservation::Assigned { host, tenant })
    }

    async fn wake_on_assigned_host(
        &self,
        tenant_id: &str,
        required_mb: i64,
    ) -> FleetResult<WakeReservation> {
        let mut state = self.state.lock().unwrap();
        let tenant = state
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| FleetError::TenantNotFound {
                id: tenant_id.to_string(),
            })?;
        if tenant.status != TenantStatus::Sleeping {
            return Ok(WakeReservation::NotSleeping(tenant.status));
        }

        let host_id = tenant.assigned_host_id.clone().ok_or_else(|| {
            FleetError::Internal(format!("休眠租户 {tenant_id} 没有绑定主机"))
        })?;
        let host = state
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| FleetError::HostNotFound { id: host_id.clone() })?;
        if host.headroom_mb() < required_mb {
            return Ok(WakeReservation::InsufficientCapacity {
                host_id,
                required_mb,
            });
        }
        host.ram_used_mb += required_mb;
        let host = host.clone();

        let now = Utc::now();
        let tenant = match state.tenants.get_mut(tenant_id) {
            Some(tenant) => {
                tenant.status = TenantStatus::Active;
                tenant.last_active_at = now;
                tenant.updated_at = now;
                tenant.clone()
            }
            None => {
                return Err(FleetError::TenantNotFound {
                    id: tenant_id.to_string(),
                })
            }
        };

        Ok(WakeReservation::Claimed { host, tenant })
    }

    async fn recompute_ram(
        &self,
        host_id: &str,
        plans: &PlanRamTable,
    ) -> FleetResult<Option<i64>> {
        let mut state = self.state.lock().unwrap();
        let booked: i64 = state
            .tenants
            .values()
            .filter(|tenant| {
                tenant.assigned_host_id.as_deref() == Some(host_id) && tenant.status.is_booked()
            })
            .map(|tenant| plans.ram_for(tenant.plan_tier))
            .sum();

        match state.hosts.get_mut(host_id) {
            Some(host) => {
                host.ram_used_mb = booked;
                Ok(Some(booked))
            }
            None => Ok(None),
        }
    }

    async fn has_headroom(&self, required_mb: i64) -> FleetResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.hosts.values().any(|host| host.can_reserve(required_mb)))
    }

    async fn set_status(
        &self,
        host_id: &str,
        status: HostStatus,
    ) -> FleetResult<Option<WorkerHost>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.hosts.get_mut(host_id).map(|host| {
            host.status = status;
            host.clone()
        }))
    }

    async fn record_probe(
        &self,
        host_id: &str,
        measured_ram_used_mb: Option<i64>,
        seen_at: DateTime<Utc>,
    ) -> FleetResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(host) = state.hosts.get_mut(host_id) {
            host.last_seen_at = seen_at;
            if measured_ram_used_mb.is_some() {
                host.measured_ram_used_mb = measured_ram_used_mb;
            }
        }
        Ok(())
    }

    async fn remove_if_unassigned(&self, host_id: &str) -> FleetResult<HostRemoval> {
        let mut state = self.state.lock().unwrap();
        if !state.hosts.contains_key(host_id) {
            return Ok(HostRemoval::NotFound);
        }
        let assigned = state
            .tenants
            .values()
            .filter(|tenant| {
                tenant.assigned_host_id.as_deref() == Some(host_id)
                    && tenant.status != TenantStatus::Purged
            })
            .count() as i64;
        if assigned > 0 {
            return Ok(HostRemoval::InUse { assigned });
        }
        match state.hosts.remove(host_id) {
            Some(host) => Ok(HostRemoval::Removed(host)),
            None => Ok(HostRemoval::NotFound),
        }
    }
}

#[async_trait]
impl TenantRepository for InMemoryFleetStore {
    async fn create(&self, new_tenant: &NewTenant) -> FleetResult<Tenant> {
        let mut state = self.state.lock().unwrap();
        if state.tenants.contains_key(&new_tenant.id) {
            return Err(FleetError::DatabaseOperation(format!(
                "租户已存在: {}",
                new_tenant.id
            )));
        }
        let tenant = Tenant::new(new_tenant.clone());
        state.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(tenant)
    }

    async fn get_by_id(&self, tenant_id: &str) -> FleetResult<Option<Tenant>> {
        Ok(self.tenant(tenant_id))
    }

    async fn transition(&self, transition: &StatusTransition) -> FleetResult<Option<Tenant>> {
        let mut state = self.state.lock().unwrap();
        let Some(tenant) = state.tenants.get_mut(&transition.tenant_id) else {
            return Ok(None);
        };
        if transition.apply(tenant, Utc::now()) {
            Ok(Some(tenant.clone()))
        } else {
            Ok(None)
        }
    }

    async fn list_by_status(&self, statuses: &[TenantStatus]) -> FleetResult<Vec<Tenant>> {
        let state = self.state.lock().unwrap();
        let mut tenants: Vec<Tenant> = state
            .tenants
            .values()
            .filter(|tenant| statuses.contains(&tenant.status))
            .cloned()
            .collect();
        tenants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tenants)
    }

    async fn count_by_status(&self, status: TenantStatus) -> FleetResult<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tenants
            .values()
            .filter(|tenant| tenant.status == status)
            .count() as i64)
    }

    async fn list_stalled(
        &self,
        statuses: &[TenantStatus],
        updated_before: DateTime<Utc>,
    ) -> FleetResult<Vec<Tenant>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tenants
            .values()
            .filter(|tenant| statuses.contains(&tenant.status) && tenant.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn touch_activity(&self, tenant_id: &str, at: DateTime<Utc>) -> FleetResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.tenants.get_mut(tenant_id) {
            Some(tenant) => {
                if at > tenant.last_active_at {
                    tenant.last_active_at = at;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Audit log kept in memory
#[derive(Debug, Clone, Default)]
pub struct MockTaskAuditRepository {
    records: Arc<Mutex<Vec<TaskAuditRecord>>>,
}

impl MockTaskAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskAuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskAuditRepository for MockTaskAuditRepository {
    async fn record(&self, record: &TaskAuditRecord) -> FleetResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list_for_task(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> FleetResult<Vec<TaskAuditRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.tenant_id == tenant_id && record.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Cache and lease service with TTL expiry
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }
}

#[async_trait]
impl CacheService for InMemoryCache {
    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> FleetResult<()> {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }
}

#[async_trait]
impl LeaseService for InMemoryCache {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> FleetResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> FleetResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.value == holder => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// A command issued through the fake remote channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub address: String,
    pub command: String,
}

#[derive(Debug, Clone)]
enum FakeResponse {
    Output(CommandOutput),
    TransportError(String),
}

/// Remote executor that records every command
///
/// Responses are matched by substring, first rule wins; unmatched commands
/// succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct FakeRemoteExecutor {
    calls: Arc<Mutex<Vec<RemoteCall>>>,
    rules: Arc<Mutex<Vec<(String, FakeResponse)>>>,
    delay: Arc<Mutex<Duration>>,
}

impl FakeRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_to(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), FakeResponse::Output(output)));
        self
    }

    pub fn fail_on(&self, pattern: &str, message: &str) -> &Self {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            FakeResponse::TransportError(message.to_string()),
        ));
        self
    }

    pub fn clear_rules(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.command.contains(pattern))
            .count()
    }

    /// Index of the first call containing `pattern`
    pub fn position_of(&self, pattern: &str) -> Option<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .position(|call| call.command.contains(pattern))
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemoteExecutor {
    async fn run(
        &self,
        address: &str,
        command: &str,
        _timeout: Duration,
    ) -> FleetResult<CommandOutput> {
        self.calls.lock().unwrap().push(RemoteCall {
            address: address.to_string(),
            command: command.to_string(),
        });

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            Some(FakeResponse::Output(output)) => Ok(output),
            Some(FakeResponse::TransportError(message)) => Err(FleetError::remote(address, message)),
            None => Ok(CommandOutput::success("")),
        }
    }
}

/// Cloud provisioner that can simulate the new host calling back to register
#[derive(Clone, Default)]
pub struct FakeCloudProvisioner {
    created: Arc<Mutex<Vec<HostCreateRequest>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    auto_register: Option<(InMemoryFleetStore, i64, Duration)>,
    failure: Option<String>,
    sequence: Arc<AtomicUsize>,
}

impl FakeCloudProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// New hosts register themselves into `store` after `delay`
    pub fn with_auto_register(store: InMemoryFleetStore, ram_total_mb: i64, delay: Duration) -> Self {
        Self {
            auto_register: Some((store, ram_total_mb, delay)),
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created(&self) -> Vec<HostCreateRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvisioner for FakeCloudProvisioner {
    async fn create_host(&self, request: &HostCreateRequest) -> FleetResult<CreatedHost> {
        self.created.lock().unwrap().push(request.clone());
        if let Some(message) = &self.failure {
            return Err(FleetError::Provisioning(message.clone()));
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let provider_id = format!("srv-{n}");

        if let Some((store, ram_total_mb, delay)) = self.auto_register.clone() {
            let registration = HostRegistration {
                address: format!("10.200.0.{n}"),
                ram_total_mb,
                hostname: request.name.clone(),
                provider_id: Some(provider_id.clone()),
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = store.register(&registration).await;
            });
        }

        Ok(CreatedHost {
            provider_id,
            name: request.name.clone(),
        })
    }

    async fn delete_host(&self, provider_id: &str) -> FleetResult<()> {
        self.deleted.lock().unwrap().push(provider_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub contact: String,
    pub kind: NotificationKind,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        contact: &str,
        kind: NotificationKind,
        context: &serde_json::Value,
    ) -> FleetResult<()> {
        self.sent.lock().unwrap().push(SentNotification {
            contact: contact.to_string(),
            kind,
            context: context.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeCredentialRevoker {
    revoked: Arc<Mutex<Vec<String>>>,
}

impl FakeCredentialRevoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialRevoker for FakeCredentialRevoker {
    async fn revoke(&self, tenant_id: &str) -> FleetResult<()> {
        self.revoked.lock().unwrap().push(tenant_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeGatewayConfigSource;

#[async_trait]
impl GatewayConfigSource for FakeGatewayConfigSource {
    async fn authoritative_config(&self, tenant: &Tenant) -> FleetResult<serde_json::Value> {
        Ok(serde_json::json!({
            "tenant_id": tenant.id,
            "plan": tenant.plan_tier.as_str(),
        }))
    }
}
