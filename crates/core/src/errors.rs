use thiserror::Error;

/// 编排器错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("主机未找到: {id}")]
    HostNotFound { id: String },

    #[error("租户未找到: {id}")]
    TenantNotFound { id: String },

    #[error("容量不足: 没有主机能提供 {required_mb}MB 内存")]
    CapacityExhausted { required_mb: i64 },

    #[error("主机 {id} 仍有 {assigned} 个租户，无法移除")]
    HostInUse { id: String, assigned: i64 },

    #[error("远程命令执行失败 [{host}]: {message}，可稍后重试")]
    RemoteExec { host: String, message: String },

    #[error("租户 {tenant_id} 健康检查超时 ({waited_secs}秒)")]
    HealthCheckTimeout { tenant_id: String, waited_secs: u64 },

    #[error("新主机在 {waited_secs} 秒内未完成注册，请检查云服务商控制台和主机启动日志")]
    ProvisioningTimeout { waited_secs: u64 },

    #[error("主机创建失败: {0}")]
    Provisioning(String),

    #[error("无效的状态转换: 租户 {tenant_id} 当前状态 {from}，无法执行 {action}")]
    InvalidTransition {
        tenant_id: String,
        from: String,
        action: String,
    },

    #[error("参数无效: {0}")]
    InvalidInput(String),

    #[error("缓存错误: {0}")]
    Cache(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn remote(host: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::RemoteExec {
            host: host.into(),
            message: message.into(),
        }
    }

    /// 是否可以在下一个调度周期重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::RemoteExec { .. }
                | FleetError::HealthCheckTimeout { .. }
                | FleetError::CapacityExhausted { .. }
                | FleetError::Network(_)
                | FleetError::Cache(_)
                | FleetError::Database(_)
        )
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, FleetError>;
