use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Duration;

use fleet_core::{
    config::{GatewayConfig, RemoteConfig},
    models::{CommandOutput, Tenant},
    traits::RemoteExecutor,
    FleetError, FleetResult,
};

/// 工作主机上的容器命令构造器
///
/// 所有命令都是幂等的：重复执行不会产生第二个容器，也不会因为目标已不存在而失败。
#[derive(Debug, Clone)]
pub struct ContainerCommands {
    image: String,
    storage_root: String,
    container_port: u16,
    health_path: String,
    gateway_config_path: String,
    reload_command: String,
}

impl ContainerCommands {
    pub fn new(remote: &RemoteConfig, gateway: &GatewayConfig) -> Self {
        Self {
            image: remote.agent_image.clone(),
            storage_root: remote.storage_root.trim_end_matches('/').to_string(),
            container_port: remote.container_port,
            health_path: remote.health_path.clone(),
            gateway_config_path: remote.gateway_config_path.clone(),
            reload_command: gateway.reload_command.clone(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tenant_storage(&self, tenant_id: &str) -> String {
        format!("{}/{}", self.storage_root, tenant_id)
    }

    /// 启动容器：已存在则 `docker start`，否则 `docker run`
    pub fn start(&self, tenant: &Tenant, memory_mb: i64) -> String {
        let name = quote(&tenant.container());
        let storage = quote(&self.tenant_storage(&tenant.id));
        format!(
            "mkdir -p {storage} && (docker start {name} >/dev/null 2>&1 || docker run -d --name {name} \
             --restart unless-stopped --memory {memory_mb}m -v {storage}:/data \
             -e TENANT_ID={tenant_id} -e PLAN_TIER={plan} {image})",
            tenant_id = quote(&tenant.id),
            plan = tenant.plan_tier,
            image = quote(&self.image),
        )
    }

    /// 停止容器；容器不存在时视为成功
    pub fn stop(&self, container: &str) -> String {
        let name = quote(container);
        format!(
            "docker stop -t 10 {name} >/dev/null 2>&1 || ! docker inspect {name} >/dev/null 2>&1"
        )
    }

    /// 删除容器和租户数据目录
    pub fn remove(&self, container: &str, tenant_id: &str) -> String {
        format!(
            "docker rm -f {} >/dev/null 2>&1; rm -rf {}",
            quote(container),
            quote(&self.tenant_storage(tenant_id))
        )
    }

    pub fn health(&self, container: &str) -> String {
        format!(
            "docker exec {} curl -fsS http://localhost:{}{}",
            quote(container),
            self.container_port,
            self.health_path
        )
    }

    /// 写入网关配置并通知容器重新加载
    pub fn apply_gateway_config(
        &self,
        container: &str,
        config: &serde_json::Value,
    ) -> FleetResult<String> {
        let encoded = BASE64.encode(serde_json::to_vec(config)?);
        let name = quote(container);
        Ok(format!(
            "echo {encoded} | base64 -d | docker exec -i {name} sh -c {write} && docker exec {name} sh -c {reload}",
            write = quote(&format!("cat > {}", self.gateway_config_path)),
            reload = quote(&self.reload_command),
        ))
    }

    /// 清除上次崩溃遗留的会话锁文件
    pub fn clear_session_locks(&self, tenant_id: &str) -> String {
        format!(
            "rm -f {}/sessions/*.lock",
            quote(&self.tenant_storage(tenant_id))
        )
    }

    pub fn pull_image(&self) -> String {
        format!("docker pull {}", quote(&self.image))
    }

    pub fn memory_usage() -> &'static str {
        "free -m | awk '/^Mem:/ {print $3}'"
    }

    pub fn parse_memory_usage(stdout: &str) -> Option<i64> {
        stdout.trim().parse().ok()
    }
}

/// 单引号转义，租户ID和路径不会被shell再次解释
fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 执行远程命令，非零退出码转换为 `RemoteExec` 错误
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    address: &str,
    command: &str,
    timeout: Duration,
) -> FleetResult<CommandOutput> {
    let output = executor.run(address, command, timeout).await?;
    if output.is_success() {
        Ok(output)
    } else {
        Err(FleetError::remote(
            address,
            format!("退出码 {}: {}", output.exit_code, output.stderr.trim()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::models::{NewTenant, PlanTier};

    fn commands() -> ContainerCommands {
        ContainerCommands::new(&RemoteConfig::default(), &GatewayConfig::default())
    }

    fn tenant() -> Tenant {
        Tenant::new(NewTenant {
            id: "t-42".to_string(),
            plan_tier: PlanTier::Pro,
            contact: "owner@example.com".to_string(),
            channels: vec![],
        })
    }

    #[test]
    fn test_start_reuses_existing_container() {
        let cmd = commands().start(&tenant(), 2048);
        assert!(cmd.contains("docker start agent-t-42"));
        assert!(cmd.contains("docker run -d --name agent-t-42"));
        assert!(cmd.contains("--memory 2048m"));
        assert!(cmd.find("docker start").unwrap() < cmd.find("docker run").unwrap());
    }

    #[test]
    fn test_quote_escapes_shell_metacharacters() {
        assert_eq!(quote("agent-1"), "agent-1");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("x'; rm -rf /"), r"'x'\''; rm -rf /'");
    }

    #[test]
    fn test_gateway_config_is_base64_encoded() {
        let config = serde_json::json!({"auth": {"token": "secret"}});
        let cmd = commands().apply_gateway_config("agent-t-42", &config).unwrap();
        let encoded = BASE64.encode(serde_json::to_vec(&config).unwrap());
        assert!(cmd.contains(&encoded));
        assert!(!cmd.contains("secret"));
        assert!(cmd.contains("kill -HUP 1"));
    }

    #[test]
    fn test_parse_memory_usage() {
        assert_eq!(ContainerCommands::parse_memory_usage("5120\n"), Some(5120));
        assert_eq!(ContainerCommands::parse_memory_usage("n/a"), None);
    }
}
