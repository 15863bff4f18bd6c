use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    capacity::{CapacityConfig, ProvisioningConfig},
    database::{CacheConfig, DatabaseConfig},
    integrations::{CloudConfig, GatewayConfig, NotificationConfig, RemoteConfig},
    lifecycle::{GraceConfig, LifecycleConfig, WatchdogConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub capacity: CapacityConfig,
    pub provisioning: ProvisioningConfig,
    pub lifecycle: LifecycleConfig,
    pub grace: GraceConfig,
    pub watchdog: WatchdogConfig,
    pub remote: RemoteConfig,
    pub cloud: CloudConfig,
    pub notification: NotificationConfig,
    pub gateway: GatewayConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: FLEET, separator: `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/fleet.toml", "fleet.toml", "/etc/fleet/config.toml"];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        // FLEET__DATABASE__URL 覆盖 database.url
        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.cache.validate().context("缓存配置验证失败")?;
        self.capacity.validate().context("容量配置验证失败")?;
        self.provisioning
            .validate()
            .context("主机创建配置验证失败")?;
        self.lifecycle.validate().context("生命周期配置验证失败")?;
        self.grace.validate().context("宽限期配置验证失败")?;
        self.watchdog.validate().context("看门狗配置验证失败")?;
        self.remote.validate().context("远程命令配置验证失败")?;
        self.cloud.validate().context("云服务商配置验证失败")?;
        self.notification
            .validate()
            .context("通知配置验证失败")?;
        self.gateway.validate().context("网关配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
