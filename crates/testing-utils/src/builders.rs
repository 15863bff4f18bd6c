//! Test data builders with sensible defaults

use chrono::{DateTime, Duration, Utc};
use fleet_core::models::{
    ChannelKind, HostStatus, PlanTier, Tenant, TenantStatus, WorkerHost,
};

/// Builder for creating test WorkerHost entities
pub struct HostBuilder {
    host: WorkerHost,
}

impl HostBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            host: WorkerHost {
                id: "host-1".to_string(),
                address: "10.0.0.1".to_string(),
                hostname: "worker-1".to_string(),
                ram_total_mb: 8192,
                ram_used_mb: 0,
                measured_ram_used_mb: None,
                status: HostStatus::Active,
                provider_id: None,
                registered_at: now,
                last_seen_at: now,
            },
        }
    }

    /// Sets the id and derives a distinct address from it
    pub fn with_id(mut self, id: &str) -> Self {
        self.host.id = id.to_string();
        self.host.address = format!("{id}.fleet.internal");
        self.host.hostname = id.to_string();
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.host.address = address.to_string();
        self
    }

    pub fn with_ram(mut self, total_mb: i64, used_mb: i64) -> Self {
        self.host.ram_total_mb = total_mb;
        self.host.ram_used_mb = used_mb;
        self
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.host.status = status;
        self
    }

    pub fn with_provider_id(mut self, provider_id: &str) -> Self {
        self.host.provider_id = Some(provider_id.to_string());
        self
    }

    pub fn registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.host.registered_at = at;
        self
    }

    pub fn build(self) -> WorkerHost {
        self.host
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Tenant entities
pub struct TenantBuilder {
    tenant: Tenant,
}

impl TenantBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            tenant: Tenant {
                id: "tenant-1".to_string(),
                plan_tier: PlanTier::Pro,
                status: TenantStatus::Pending,
                assigned_host_id: None,
                container_name: None,
                contact: "owner@example.com".to_string(),
                channels: vec![],
                last_active_at: now,
                created_at: now,
                grace_period_end: None,
                cancelled_at: None,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.tenant.id = id.to_string();
        self
    }

    pub fn with_plan(mut self, plan: PlanTier) -> Self {
        self.tenant.plan_tier = plan;
        self
    }

    pub fn with_status(mut self, status: TenantStatus) -> Self {
        self.tenant.status = status;
        self
    }

    /// Assigns the tenant to a host with the default container name
    pub fn on_host(mut self, host_id: &str) -> Self {
        self.tenant.assigned_host_id = Some(host_id.to_string());
        self.tenant.container_name = Some(Tenant::default_container_name(&self.tenant.id));
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelKind>) -> Self {
        self.tenant.channels = channels;
        self
    }

    pub fn with_contact(mut self, contact: &str) -> Self {
        self.tenant.contact = contact.to_string();
        self
    }

    pub fn aged(mut self, age: Duration) -> Self {
        self.tenant.created_at = Utc::now() - age;
        self
    }

    pub fn idle_for(mut self, idle: Duration) -> Self {
        self.tenant.last_active_at = Utc::now() - idle;
        self
    }

    pub fn updated_ago(mut self, ago: Duration) -> Self {
        self.tenant.updated_at = Utc::now() - ago;
        self
    }

    pub fn with_grace_period_end(mut self, end: DateTime<Utc>) -> Self {
        self.tenant.grace_period_end = Some(end);
        self
    }

    pub fn with_cancelled_at(mut self, at: DateTime<Utc>) -> Self {
        self.tenant.cancelled_at = Some(at);
        self
    }

    pub fn build(self) -> Tenant {
        self.tenant
    }
}

impl Default for TenantBuilder {
    fn default() -> Self {
        Self::new()
    }
}
