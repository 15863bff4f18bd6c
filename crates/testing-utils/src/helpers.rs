//! Test helper utilities and common testing patterns

use fleet_core::AppConfig;
use std::time::Duration;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Configuration with intervals shortened for tests
    ///
    /// Business windows (idle, min age, grace days) keep their production
    /// values so scenario tests exercise the real boundaries.
    pub fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.provisioning.poll_interval_seconds = 1;
        config.provisioning.timeout_seconds = 3;
        config.provisioning.lease_ttl_seconds = 10;
        config.lifecycle.health_poll_interval_seconds = 1;
        config.lifecycle.health_timeout_seconds = 2;
        config.watchdog.check_interval_seconds = 1;
        config
    }
}
