//! 外部协作方接口：远程命令通道、云服务商、通知、凭据吊销、网关配置

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{CommandOutput, NotificationKind, Tenant};
use crate::FleetResult;

/// 在工作主机上执行命令
///
/// 传输层失败（连接拒绝、超时）返回 `FleetError::RemoteExec`；
/// 命令本身非零退出通过 `CommandOutput::exit_code` 反映，由调用方判断。
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, address: &str, command: &str, timeout: Duration)
        -> FleetResult<CommandOutput>;
}

/// 新主机创建请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCreateRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub region: String,
    /// 主机启动时执行的脚本，负责回调注册接口
    pub user_data: String,
}

/// 云服务商返回的主机信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedHost {
    pub provider_id: String,
    pub name: String,
}

#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    async fn create_host(&self, request: &HostCreateRequest) -> FleetResult<CreatedHost>;

    async fn delete_host(&self, provider_id: &str) -> FleetResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        contact: &str,
        kind: NotificationKind,
        context: &serde_json::Value,
    ) -> FleetResult<()>;
}

/// 吊销租户在外部模型代理上的API凭据
#[async_trait]
pub trait CredentialRevoker: Send + Sync {
    async fn revoke(&self, tenant_id: &str) -> FleetResult<()>;
}

/// 权威网关配置来源，每次容器启动后都要重新下发
#[async_trait]
pub trait GatewayConfigSource: Send + Sync {
    async fn authoritative_config(&self, tenant: &Tenant) -> FleetResult<serde_json::Value>;
}
