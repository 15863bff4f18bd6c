use async_trait::async_trait;
use fleet_core::{
    config::RemoteConfig,
    errors::{FleetError, Result},
    models::CommandOutput,
    traits::RemoteExecutor,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh 自身连接失败时的退出码
const SSH_CONNECTION_FAILURE: i32 = 255;

/// 通过 ssh 在工作主机上执行命令
pub struct SshRemoteExecutor {
    user: String,
    port: u16,
    key_path: Option<String>,
    connect_timeout_seconds: u64,
}

impl SshRemoteExecutor {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            port: config.ssh_port,
            key_path: config.ssh_key_path.clone(),
            connect_timeout_seconds: config.connect_timeout_seconds,
        }
    }

    /// 构建 ssh 参数，远程命令作为最后一个参数整体传递
    pub fn ssh_args(&self, address: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_seconds),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.user, address));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshRemoteExecutor {
    async fn run(&self, address: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("远程执行 [{}]: {}", address, command);

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(address, command));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| FleetError::remote(address, format!("启动ssh失败: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| FleetError::remote(address, e.to_string()))?,
            Err(_) => {
                warn!("远程命令超时 [{}] ({:?}): {}", address, timeout, command);
                return Err(FleetError::remote(
                    address,
                    format!("命令在 {} 秒内未完成", timeout.as_secs()),
                ));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(FleetError::remote(address, format!("ssh连接失败: {stderr}")));
        }

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
