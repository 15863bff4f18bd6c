use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Metrics collector for the fleet orchestrator
///
/// Handles are registered once at construction; without an installed
/// recorder every call is a no-op, so tests can use it freely.
pub struct MetricsCollector {
    // Capacity metrics
    reservations_total: Counter,
    capacity_exhausted_total: Counter,
    ram_recomputations_total: Counter,

    // Provisioning metrics
    host_creations_total: Counter,
    host_creation_failures_total: Counter,
    host_creation_duration: Histogram,

    // Lifecycle metrics
    containers_started_total: Counter,
    containers_slept_total: Counter,
    wakes_total: Counter,
    wake_duration: Histogram,
    remote_failures_total: Counter,

    // Fleet gauges
    active_hosts: Gauge,
    fleet_ram_total_mb: Gauge,
    fleet_ram_booked_mb: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            reservations_total: counter!("fleet_reservations_total"),
            capacity_exhausted_total: counter!("fleet_capacity_exhausted_total"),
            ram_recomputations_total: counter!("fleet_ram_recomputations_total"),
            host_creations_total: counter!("fleet_host_creations_total"),
            host_creation_failures_total: counter!("fleet_host_creation_failures_total"),
            host_creation_duration: histogram!("fleet_host_creation_duration_seconds"),
            containers_started_total: counter!("fleet_containers_started_total"),
            containers_slept_total: counter!("fleet_containers_slept_total"),
            wakes_total: counter!("fleet_wakes_total"),
            wake_duration: histogram!("fleet_wake_duration_seconds"),
            remote_failures_total: counter!("fleet_remote_failures_total"),
            active_hosts: gauge!("fleet_active_hosts"),
            fleet_ram_total_mb: gauge!("fleet_ram_total_mb"),
            fleet_ram_booked_mb: gauge!("fleet_ram_booked_mb"),
        }
    }

    // Capacity metrics

    pub fn record_reservation(&self, host_id: &str, required_mb: i64) {
        self.reservations_total.increment(1);
        debug!(host_id = host_id, required_mb = required_mb, "Capacity reserved");
    }

    pub fn record_capacity_exhausted(&self, required_mb: i64) {
        self.capacity_exhausted_total.increment(1);
        warn!(required_mb = required_mb, "No host has enough headroom");
    }

    pub fn record_recompute(&self) {
        self.ram_recomputations_total.increment(1);
    }

    // Provisioning metrics

    pub fn record_host_creation(&self, duration_seconds: f64) {
        self.host_creations_total.increment(1);
        self.host_creation_duration.record(duration_seconds);
        info!(duration_seconds = duration_seconds, "Host creation completed");
    }

    pub fn record_host_creation_failure(&self, reason: &str) {
        self.host_creation_failures_total.increment(1);
        warn!(reason = reason, "Host creation failed");
    }

    // Lifecycle metrics

    pub fn record_container_started(&self) {
        self.containers_started_total.increment(1);
    }

    pub fn record_container_slept(&self) {
        self.containers_slept_total.increment(1);
    }

    pub fn record_wake(&self, duration_seconds: f64) {
        self.wakes_total.increment(1);
        self.wake_duration.record(duration_seconds);
    }

    pub fn record_remote_failure(&self, operation: &str) {
        self.remote_failures_total.increment(1);
        counter!("fleet_remote_failures_by_operation_total", "operation" => operation.to_string())
            .increment(1);
    }

    pub fn record_grace_transition(&self, step: &'static str) {
        counter!("fleet_grace_transitions_total", "step" => step).increment(1);
    }

    pub fn record_watchdog_decision(&self, action: &'static str) {
        counter!("fleet_watchdog_decisions_total", "action" => action).increment(1);
    }

    // Fleet gauges

    pub fn update_fleet_capacity(&self, active_hosts: usize, ram_total_mb: i64, ram_booked_mb: i64) {
        self.active_hosts.set(active_hosts as f64);
        self.fleet_ram_total_mb.set(ram_total_mb as f64);
        self.fleet_ram_booked_mb.set(ram_booked_mb as f64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus exporter with its own HTTP listener
pub fn init_prometheus_exporter(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;

    info!("Prometheus指标导出器已启动: {}", addr);
    Ok(())
}
