use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 远程命令通道配置（ssh + docker）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key_path: Option<String>,
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    /// 智能体容器镜像
    pub agent_image: String,
    /// 主机上租户数据目录的根路径
    pub storage_root: String,
    pub container_port: u16,
    pub health_path: String,
    /// 网关配置在容器内的路径
    pub gateway_config_path: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_key_path: None,
            connect_timeout_seconds: 10,
            command_timeout_seconds: 60,
            agent_image: "ghcr.io/fleet/agent:latest".to_string(),
            storage_root: "/srv/agents".to_string(),
            container_port: 8080,
            health_path: "/health".to_string(),
            gateway_config_path: "/app/config/gateway.json".to_string(),
        }
    }
}

impl RemoteConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ssh_user.is_empty() {
            return Err(anyhow::anyhow!("SSH用户不能为空"));
        }

        if self.agent_image.is_empty() {
            return Err(anyhow::anyhow!("智能体镜像不能为空"));
        }

        if !self.storage_root.starts_with('/') || self.storage_root == "/" {
            return Err(anyhow::anyhow!("数据根目录必须是非根的绝对路径"));
        }

        if self.command_timeout_seconds == 0 || self.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("远程命令超时必须大于0"));
        }

        if !self.health_path.starts_with('/') {
            return Err(anyhow::anyhow!("健康检查路径必须以/开头"));
        }

        Ok(())
    }
}

/// 云服务商配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_token: String,
    pub server_type: String,
    pub image: String,
    pub region: String,
    /// 新主机启动后回调的注册地址
    pub register_callback_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.hetzner.cloud/v1".to_string(),
            api_token: String::new(),
            server_type: "cx42".to_string(),
            image: "docker-ce".to_string(),
            region: "fsn1".to_string(),
            register_callback_url: "http://127.0.0.1:8080/internal/hosts/register".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl CloudConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.api_url.starts_with("http") {
            return Err(anyhow::anyhow!("云服务商API地址格式无效"));
        }

        if !self.register_callback_url.starts_with("http") {
            return Err(anyhow::anyhow!("注册回调地址格式无效"));
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("云服务商请求超时必须大于0"));
        }

        Ok(())
    }
}

/// 通知与外部凭据配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// 通知投递的webhook地址，为空时只记录日志
    pub webhook_url: Option<String>,
    /// 模型代理凭据吊销接口，`{tenant_id}` 会被替换
    pub credential_revoke_url: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            credential_revoke_url: None,
            api_token: None,
            request_timeout_seconds: 10,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(url) = &self.credential_revoke_url {
            if !url.contains("{tenant_id}") {
                return Err(anyhow::anyhow!("凭据吊销地址必须包含{{tenant_id}}占位符"));
            }
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("通知请求超时必须大于0"));
        }

        Ok(())
    }
}

/// 网关配置模板
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub model_proxy_url: String,
    pub reload_command: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model_proxy_url: "http://model-proxy.internal:4000".to_string(),
            reload_command: "kill -HUP 1".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model_proxy_url.is_empty() {
            return Err(anyhow::anyhow!("模型代理地址不能为空"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_config_rejects_root_storage() {
        let mut config = RemoteConfig::default();
        assert!(config.validate().is_ok());

        config.storage_root = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_revoke_url_requires_placeholder() {
        let mut config = NotificationConfig::default();
        config.credential_revoke_url = Some("https://proxy/keys".to_string());
        assert!(config.validate().is_err());

        config.credential_revoke_url = Some("https://proxy/keys/{tenant_id}".to_string());
        assert!(config.validate().is_ok());
    }
}
