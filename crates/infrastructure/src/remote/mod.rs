//! 外部协作方的生产实现：ssh 远程命令、云服务商 API、通知 webhook、凭据吊销、网关配置

pub mod cloud;
pub mod gateway;
pub mod notifier;
pub mod ssh_executor;

pub use cloud::HttpCloudProvisioner;
pub use gateway::StaticGatewayConfigSource;
pub use notifier::{HttpCredentialRevoker, WebhookNotifier};
pub use ssh_executor::SshRemoteExecutor;
