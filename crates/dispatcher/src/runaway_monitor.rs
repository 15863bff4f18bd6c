use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use fleet_core::{
    config::WatchdogConfig,
    models::{
        RecordedAction, TaskAuditRecord, TaskKey, TaskMonitorState, TaskWatchStatus,
        WatchdogAction, WatchdogDecision, WatchdogReason,
    },
    traits::TaskAuditRepository,
    FleetResult,
};
use fleet_infrastructure::MetricsCollector;

/// 按规则顺序评估任务状态，第一条命中的规则生效
///
/// 1. 运行时间超过硬上限 → kill
/// 2. 最近 K 个动作完全相同 → kill
/// 3. token 用量超过软上限 → pause
pub fn evaluate(
    state: &TaskMonitorState,
    now: DateTime<Utc>,
    config: &WatchdogConfig,
) -> Option<(WatchdogAction, WatchdogReason)> {
    let runtime_secs = state.runtime_secs(now);
    if runtime_secs > config.max_runtime_seconds {
        return Some((
            WatchdogAction::Kill,
            WatchdogReason::RuntimeExceeded {
                runtime_secs,
                limit_secs: config.max_runtime_seconds,
            },
        ));
    }

    if state.last_actions_identical(config.loop_threshold) {
        let action_type = state
            .actions
            .last()
            .map(|action| action.action_type.clone())
            .unwrap_or_default();
        return Some((
            WatchdogAction::Kill,
            WatchdogReason::LoopDetected {
                action_type,
                repetitions: config.loop_threshold,
            },
        ));
    }

    if state.tokens_used > config.token_soft_cap {
        return Some((
            WatchdogAction::Pause,
            WatchdogReason::TokenBudgetExceeded {
                tokens_used: state.tokens_used,
                limit: config.token_soft_cap,
            },
        ));
    }

    None
}

struct MonitorInner {
    states: RwLock<HashMap<TaskKey, TaskMonitorState>>,
    generations: AtomicU64,
    audit: Arc<dyn TaskAuditRepository>,
    config: WatchdogConfig,
    decisions: broadcast::Sender<WatchdogDecision>,
    metrics: Arc<MetricsCollector>,
}

/// 失控任务看门狗
///
/// 只发出判定信号，真正终止或暂停进程由订阅判定的外部执行器负责。
#[derive(Clone)]
pub struct RunawayTaskMonitor {
    inner: Arc<MonitorInner>,
}

impl RunawayTaskMonitor {
    pub fn new(
        audit: Arc<dyn TaskAuditRepository>,
        config: WatchdogConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (decisions, _) = broadcast::channel(config.decision_channel_capacity.max(1));
        Self {
            inner: Arc::new(MonitorInner {
                states: RwLock::new(HashMap::new()),
                generations: AtomicU64::new(0),
                audit,
                config,
                decisions,
                metrics,
            }),
        }
    }

    /// 订阅判定流
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogDecision> {
        self.inner.decisions.subscribe()
    }

    /// 开始监控任务并启动看门狗，重复调用会重置任务状态
    ///
    /// 每次调用都启动新的看门狗，上一代的看门狗在下一次检查时退出。
    pub async fn start_task_monitor(&self, tenant_id: &str, task_id: &str) {
        let key = TaskKey::new(tenant_id, task_id);
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = TaskMonitorState::new(key.clone(), Utc::now());
        state.generation = generation;

        let replaced = self
            .inner
            .states
            .write()
            .await
            .insert(key.clone(), state)
            .is_some();
        if replaced {
            debug!("任务 {} 重新开始监控", key);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.watch(key, generation).await });
    }

    /// 停止监控，任务不存在时返回 false
    pub async fn stop_task_monitor(&self, tenant_id: &str, task_id: &str) -> bool {
        let key = TaskKey::new(tenant_id, task_id);
        self.inner.states.write().await.remove(&key).is_some()
    }

    pub async fn record_action(&self, tenant_id: &str, task_id: &str, action_type: &str) -> bool {
        let key = TaskKey::new(tenant_id, task_id);
        let mut states = self.inner.states.write().await;
        match states.get_mut(&key) {
            Some(state) => {
                state.actions.push(RecordedAction {
                    action_type: action_type.to_string(),
                    recorded_at: Utc::now(),
                });
                true
            }
            None => false,
        }
    }

    pub async fn add_tokens(&self, tenant_id: &str, task_id: &str, tokens: u64) -> bool {
        let key = TaskKey::new(tenant_id, task_id);
        let mut states = self.inner.states.write().await;
        match states.get_mut(&key) {
            Some(state) => {
                state.tokens_used = state.tokens_used.saturating_add(tokens);
                true
            }
            None => false,
        }
    }

    pub async fn is_paused(&self, tenant_id: &str, task_id: &str) -> bool {
        let key = TaskKey::new(tenant_id, task_id);
        self.inner
            .states
            .read()
            .await
            .get(&key)
            .map(|state| state.paused)
            .unwrap_or(false)
    }

    /// 任务的监控情况和最近一次判定
    pub async fn task_status(&self, tenant_id: &str, task_id: &str) -> FleetResult<TaskWatchStatus> {
        let key = TaskKey::new(tenant_id, task_id);
        let paused = self
            .inner
            .states
            .read()
            .await
            .get(&key)
            .map(|state| state.paused);
        let last_decision = self
            .inner
            .audit
            .list_for_task(tenant_id, task_id)
            .await?
            .into_iter()
            .max_by_key(|record| record.recorded_at);

        Ok(TaskWatchStatus {
            key,
            monitored: paused.is_some(),
            paused: paused.unwrap_or(false),
            last_decision,
        })
    }

    pub async fn monitored_count(&self) -> usize {
        self.inner.states.read().await.len()
    }

    /// 立即检查一次，返回发出的判定
    pub async fn check_now(&self, tenant_id: &str, task_id: &str) -> FleetResult<Option<WatchdogDecision>> {
        self.inner.check(&TaskKey::new(tenant_id, task_id)).await
    }
}

impl MonitorInner {
    async fn watch(&self, key: TaskKey, generation: u64) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        // 第一次 tick 立即返回
        interval.tick().await;

        loop {
            interval.tick().await;

            let monitored = self
                .states
                .read()
                .await
                .get(&key)
                .map(|state| state.generation == generation && !state.paused)
                .unwrap_or(false);
            if !monitored {
                debug!("任务 {} 已不在监控中，看门狗退出", key);
                return;
            }

            match self.check(&key).await {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(e) => error!("任务 {} 看门狗检查失败: {}", key, e),
            }
        }
    }

    async fn check(&self, key: &TaskKey) -> FleetResult<Option<WatchdogDecision>> {
        let now = Utc::now();

        // 判定和状态变更在同一把写锁内完成，避免重复判定
        let (decision, recent_actions, runtime_secs, tokens_used) = {
            let mut states = self.states.write().await;
            let Some(state) = states.get(key) else {
                return Ok(None);
            };
            if state.paused {
                return Ok(None);
            }
            let Some((action, reason)) = evaluate(state, now, &self.config) else {
                return Ok(None);
            };

            let recent_actions = state.recent_action_types(self.config.loop_threshold);
            let runtime_secs = state.runtime_secs(now);
            let tokens_used = state.tokens_used;

            match action {
                WatchdogAction::Kill => {
                    states.remove(key);
                }
                WatchdogAction::Pause => {
                    if let Some(state) = states.get_mut(key) {
                        state.paused = true;
                    }
                }
            }

            let decision = WatchdogDecision {
                key: key.clone(),
                action,
                reason,
                decided_at: now,
            };
            (decision, recent_actions, runtime_secs, tokens_used)
        };

        warn!(
            "任务 {} 被判定 {}: {}",
            key,
            decision.action.as_str(),
            decision.reason
        );

        let record = TaskAuditRecord {
            tenant_id: key.tenant_id.clone(),
            task_id: key.task_id.clone(),
            action: decision.action,
            reason: decision.reason.to_string(),
            runtime_secs,
            tokens_used,
            recent_actions,
            recorded_at: now,
        };
        if let Err(e) = self.audit.record(&record).await {
            error!("写入任务 {} 审计记录失败: {}", key, e);
        }

        self.metrics.record_watchdog_decision(decision.action.as_str());
        if self.decisions.send(decision.clone()).is_err() {
            info!("当前没有判定订阅者，任务 {} 的判定只写入审计", key);
        }
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn state(started_secs_ago: i64, actions: &[&str], tokens: u64) -> TaskMonitorState {
        let now = Utc::now();
        let mut state = TaskMonitorState::new(
            TaskKey::new("t1", "task"),
            now - ChronoDuration::seconds(started_secs_ago),
        );
        state.tokens_used = tokens;
        for action in actions {
            state.actions.push(RecordedAction {
                action_type: action.to_string(),
                recorded_at: now,
            });
        }
        state
    }

    #[test]
    fn test_five_identical_actions_kill() {
        let config = WatchdogConfig::default();
        let s = state(10, &["search"; 5], 0);
        let (action, reason) = evaluate(&s, Utc::now(), &config).unwrap();
        assert_eq!(action, WatchdogAction::Kill);
        assert!(matches!(reason, WatchdogReason::LoopDetected { repetitions: 5, .. }));
    }

    #[test]
    fn test_four_identical_actions_continue() {
        let config = WatchdogConfig::default();
        let s = state(10, &["read", "search", "search", "search", "search"], 0);
        assert!(evaluate(&s, Utc::now(), &config).is_none());
    }

    #[test]
    fn test_runtime_cap_kills_varied_actions() {
        let config = WatchdogConfig::default();
        let s = state(301, &["a", "b", "c"], 0);
        let (action, reason) = evaluate(&s, Utc::now(), &config).unwrap();
        assert_eq!(action, WatchdogAction::Kill);
        assert!(matches!(reason, WatchdogReason::RuntimeExceeded { limit_secs: 300, .. }));
    }

    #[test]
    fn test_token_cap_pauses() {
        let config = WatchdogConfig::default();
        let s = state(10, &["a", "b"], 10_001);
        let (action, _) = evaluate(&s, Utc::now(), &config).unwrap();
        assert_eq!(action, WatchdogAction::Pause);
    }

    #[test]
    fn test_runtime_rule_wins_over_tokens() {
        let config = WatchdogConfig::default();
        let s = state(400, &["a"], 50_000);
        let (action, reason) = evaluate(&s, Utc::now(), &config).unwrap();
        assert_eq!(action, WatchdogAction::Kill);
        assert!(matches!(reason, WatchdogReason::RuntimeExceeded { .. }));
    }
}
