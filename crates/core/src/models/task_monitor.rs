use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务监控键 (租户, 任务)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub tenant_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(tenant_id: &str, task_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            task_id: task_id.to_string(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.task_id)
    }
}

/// 智能体执行过程中记录的一次动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub action_type: String,
    pub recorded_at: DateTime<Utc>,
}

/// 单个预算任务的运行状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMonitorState {
    pub key: TaskKey,
    pub started_at: DateTime<Utc>,
    pub tokens_used: u64,
    pub actions: Vec<RecordedAction>,
    pub paused: bool,
    /// 每次开始监控分配的代次，旧代次的看门狗据此退出
    pub generation: u64,
}

impl TaskMonitorState {
    pub fn new(key: TaskKey, started_at: DateTime<Utc>) -> Self {
        Self {
            key,
            started_at,
            tokens_used: 0,
            actions: Vec::new(),
            paused: false,
            generation: 0,
        }
    }

    pub fn runtime_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }

    /// 最近 `count` 个动作是否完全相同
    pub fn last_actions_identical(&self, count: usize) -> bool {
        if count == 0 || self.actions.len() < count {
            return false;
        }
        let recent = &self.actions[self.actions.len() - count..];
        recent
            .iter()
            .all(|action| action.action_type == recent[0].action_type)
    }

    pub fn recent_action_types(&self, count: usize) -> Vec<String> {
        let start = self.actions.len().saturating_sub(count);
        self.actions[start..]
            .iter()
            .map(|a| a.action_type.clone())
            .collect()
    }
}

/// 看门狗判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogAction {
    Kill,
    Pause,
}

impl WatchdogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogAction::Kill => "kill",
            WatchdogAction::Pause => "pause",
        }
    }
}

/// 判定原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchdogReason {
    RuntimeExceeded { runtime_secs: i64, limit_secs: i64 },
    LoopDetected { action_type: String, repetitions: usize },
    TokenBudgetExceeded { tokens_used: u64, limit: u64 },
}

impl std::fmt::Display for WatchdogReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogReason::RuntimeExceeded {
                runtime_secs,
                limit_secs,
            } => write!(f, "运行时间 {runtime_secs}s 超过上限 {limit_secs}s"),
            WatchdogReason::LoopDetected {
                action_type,
                repetitions,
            } => write!(f, "连续 {repetitions} 次相同动作 '{action_type}'"),
            WatchdogReason::TokenBudgetExceeded { tokens_used, limit } => {
                write!(f, "token用量 {tokens_used} 超过软上限 {limit}")
            }
        }
    }
}

/// 看门狗发出的判定信号，由外部执行器负责真正终止或暂停进程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogDecision {
    pub key: TaskKey,
    pub action: WatchdogAction,
    pub reason: WatchdogReason,
    pub decided_at: DateTime<Utc>,
}

/// 判定审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAuditRecord {
    pub tenant_id: String,
    pub task_id: String,
    pub action: WatchdogAction,
    pub reason: String,
    pub runtime_secs: i64,
    pub tokens_used: u64,
    pub recent_actions: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// 任务的当前监控情况，执行器据此轮询判定结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWatchStatus {
    pub key: TaskKey,
    /// 仍在监控中；被 kill 或停止监控后为 false
    pub monitored: bool,
    pub paused: bool,
    pub last_decision: Option<TaskAuditRecord>,
}
