use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 容器生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sleep_sweep_interval_seconds: u64,
    /// 空闲超过该时长的容器会被休眠
    pub sleep_after_minutes: i64,
    /// 创建时间不足该时长的租户不参与休眠
    pub min_age_minutes: i64,
    pub stalled_start_after_minutes: i64,
    pub activity_debounce_seconds: u64,
    pub health_poll_interval_seconds: u64,
    pub health_timeout_seconds: u64,
    pub host_health_interval_seconds: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sleep_sweep_interval_seconds: 300,
            sleep_after_minutes: 30,
            min_age_minutes: 60,
            stalled_start_after_minutes: 10,
            activity_debounce_seconds: 60,
            health_poll_interval_seconds: 2,
            health_timeout_seconds: 60,
            host_health_interval_seconds: 60,
        }
    }
}

impl LifecycleConfig {
    pub fn sleep_after(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.sleep_after_minutes)
    }

    pub fn min_age(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.min_age_minutes)
    }

    pub fn stalled_start_after(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.stalled_start_after_minutes)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sleep_sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("休眠扫描间隔必须大于0"));
        }

        if self.sleep_after_minutes <= 0 {
            return Err(anyhow::anyhow!("休眠空闲阈值必须大于0"));
        }

        if self.min_age_minutes < 0 || self.stalled_start_after_minutes <= 0 {
            return Err(anyhow::anyhow!("租户年龄阈值不能为负数"));
        }

        if self.health_poll_interval_seconds == 0
            || self.health_timeout_seconds < self.health_poll_interval_seconds
        {
            return Err(anyhow::anyhow!("健康检查超时必须不小于轮询间隔且间隔大于0"));
        }

        if self.host_health_interval_seconds == 0 {
            return Err(anyhow::anyhow!("主机健康检查间隔必须大于0"));
        }

        Ok(())
    }
}

/// 欠费宽限期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraceConfig {
    pub grace_period_days: i64,
    /// 宽限期结束前多少天暂停服务
    pub pause_before_end_days: i64,
    /// 取消后多少天清除数据
    pub purge_after_cancel_days: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            pause_before_end_days: 3,
            purge_after_cancel_days: 30,
            sweep_interval_seconds: 900,
        }
    }
}

impl GraceConfig {
    pub fn grace_period(&self) -> ChronoDuration {
        ChronoDuration::days(self.grace_period_days)
    }

    pub fn pause_before_end(&self) -> ChronoDuration {
        ChronoDuration::days(self.pause_before_end_days)
    }

    pub fn purge_after_cancel(&self) -> ChronoDuration {
        ChronoDuration::days(self.purge_after_cancel_days)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.grace_period_days <= 0 {
            return Err(anyhow::anyhow!("宽限期必须大于0天"));
        }

        if self.pause_before_end_days < 0 || self.pause_before_end_days > self.grace_period_days {
            return Err(anyhow::anyhow!("暂停提前天数必须在0到宽限期之间"));
        }

        if self.purge_after_cancel_days <= 0 {
            return Err(anyhow::anyhow!("数据清除延迟必须大于0天"));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("宽限期扫描间隔必须大于0"));
        }

        Ok(())
    }
}

/// 失控任务看门狗配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_seconds: u64,
    pub max_runtime_seconds: i64,
    /// 连续相同动作达到该次数判定为循环
    pub loop_threshold: usize,
    pub token_soft_cap: u64,
    pub decision_channel_capacity: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            max_runtime_seconds: 300,
            loop_threshold: 5,
            token_soft_cap: 10_000,
            decision_channel_capacity: 256,
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("看门狗检查间隔必须大于0"));
        }

        if self.max_runtime_seconds <= 0 {
            return Err(anyhow::anyhow!("任务最长运行时间必须大于0"));
        }

        if self.loop_threshold < 2 {
            return Err(anyhow::anyhow!("循环检测阈值至少为2"));
        }

        if self.decision_channel_capacity == 0 {
            return Err(anyhow::anyhow!("判定通道容量必须大于0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_defaults_are_valid() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sleep_after(), ChronoDuration::minutes(30));
        assert_eq!(config.min_age(), ChronoDuration::hours(1));
    }

    #[test]
    fn test_grace_pause_window_must_fit_in_grace_period() {
        let mut config = GraceConfig::default();
        assert!(config.validate().is_ok());

        config.pause_before_end_days = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watchdog_loop_threshold() {
        let mut config = WatchdogConfig::default();
        assert!(config.validate().is_ok());

        config.loop_threshold = 1;
        assert!(config.validate().is_err());
    }
}
