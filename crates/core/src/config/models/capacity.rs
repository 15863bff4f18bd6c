use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::PlanRamTable;

/// 容量配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub plans: PlanRamTable,
    /// 候选主机被并发预订抢走时的重试次数
    pub reserve_retry_attempts: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            plans: PlanRamTable::default(),
            reserve_retry_attempts: 3,
        }
    }
}

impl CapacityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.plans.starter_mb <= 0 || self.plans.pro_mb <= 0 || self.plans.business_mb <= 0 {
            return Err(anyhow::anyhow!("套餐内存必须大于0"));
        }

        if self.reserve_retry_attempts == 0 {
            return Err(anyhow::anyhow!("预订重试次数必须大于0"));
        }

        Ok(())
    }
}

/// 新主机创建配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// 是否允许容量不足时自动创建主机
    pub auto_create: bool,
    pub poll_interval_seconds: u64,
    pub timeout_seconds: u64,
    /// 分布式创建租约的有效期，应大于等待超时
    pub lease_ttl_seconds: u64,
    pub prewarm_timeout_seconds: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            poll_interval_seconds: 10,
            timeout_seconds: 600,
            lease_ttl_seconds: 900,
            prewarm_timeout_seconds: 600,
        }
    }
}

impl ProvisioningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("主机注册轮询间隔必须大于0"));
        }

        if self.timeout_seconds < self.poll_interval_seconds {
            return Err(anyhow::anyhow!("主机创建超时不能小于轮询间隔"));
        }

        if self.lease_ttl_seconds <= self.timeout_seconds {
            return Err(anyhow::anyhow!("创建租约有效期必须大于等待超时"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_config_rejects_zero_plan() {
        let mut config = CapacityConfig::default();
        assert!(config.validate().is_ok());

        config.plans.pro_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provisioning_lease_must_outlive_timeout() {
        let mut config = ProvisioningConfig::default();
        assert!(config.validate().is_ok());

        config.lease_ttl_seconds = config.timeout_seconds;
        assert!(config.validate().is_err());
    }
}
