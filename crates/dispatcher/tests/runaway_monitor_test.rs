mod common;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_core::{
        models::{TaskKey, TenantStatus, WatchdogAction, WatchdogReason},
        FleetError,
    };
    use fleet_testing_utils::{TenantBuilder, TestEnv};
    use tokio::time::timeout;

    use crate::common::Harness;

    fn with_tenant(harness: Harness) -> Harness {
        harness.add_tenant(
            TenantBuilder::new()
                .with_id("t1")
                .with_status(TenantStatus::Active)
                .build(),
        );
        harness
    }

    #[tokio::test]
    async fn test_identical_actions_emit_kill() {
        let harness = with_tenant(Harness::new());
        let mut decisions = harness.controller.monitor().subscribe();

        harness.controller.start_task("t1", "job-1").await.unwrap();
        for _ in 0..5 {
            assert!(harness.controller.record_task_action("t1", "job-1", "web_search").await);
        }

        let decision = timeout(Duration::from_secs(3), decisions.recv())
            .await
            .expect("decision emitted")
            .unwrap();
        assert_eq!(decision.key, TaskKey::new("t1", "job-1"));
        assert_eq!(decision.action, WatchdogAction::Kill);
        assert!(matches!(
            decision.reason,
            WatchdogReason::LoopDetected { repetitions: 5, ref action_type } if action_type == "web_search"
        ));

        let records = harness.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, WatchdogAction::Kill);
        assert_eq!(records[0].recent_actions, vec!["web_search".to_string(); 5]);

        // 终止后不再监控
        assert_eq!(harness.controller.monitor().monitored_count().await, 0);
        assert!(!harness.controller.record_task_action("t1", "job-1", "web_search").await);
    }

    #[tokio::test]
    async fn test_runtime_cap_kills_varied_task() {
        let mut config = TestEnv::fast_config();
        config.watchdog.max_runtime_seconds = 1;
        let harness = with_tenant(Harness::with_config(config));
        let mut decisions = harness.controller.monitor().subscribe();

        harness.controller.start_task("t1", "long").await.unwrap();
        harness.controller.record_task_action("t1", "long", "read").await;
        harness.controller.record_task_action("t1", "long", "write").await;

        let decision = timeout(Duration::from_secs(5), decisions.recv())
            .await
            .expect("decision emitted")
            .unwrap();
        assert_eq!(decision.action, WatchdogAction::Kill);
        assert!(matches!(
            decision.reason,
            WatchdogReason::RuntimeExceeded { limit_secs: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_token_budget_pauses_once() {
        let harness = with_tenant(Harness::new());
        let monitor = harness.controller.monitor();

        harness.controller.start_task("t1", "chatty").await.unwrap();
        assert!(harness.controller.add_task_tokens("t1", "chatty", 6_000).await);
        assert!(monitor.check_now("t1", "chatty").await.unwrap().is_none());

        assert!(harness.controller.add_task_tokens("t1", "chatty", 4_001).await);
        let decision = monitor.check_now("t1", "chatty").await.unwrap().unwrap();
        assert_eq!(decision.action, WatchdogAction::Pause);
        assert!(monitor.is_paused("t1", "chatty").await);

        // 已暂停的任务不会重复判定
        assert!(monitor.check_now("t1", "chatty").await.unwrap().is_none());
        assert_eq!(harness.audit.records().len(), 1);
        assert_eq!(harness.audit.records()[0].tokens_used, 10_001);
    }

    #[tokio::test]
    async fn test_four_repeats_after_other_action_continue() {
        let harness = with_tenant(Harness::new());
        let monitor = harness.controller.monitor();

        harness.controller.start_task("t1", "job").await.unwrap();
        for action in ["read", "search", "search", "search", "search"] {
            harness.controller.record_task_action("t1", "job", action).await;
        }

        assert!(monitor.check_now("t1", "job").await.unwrap().is_none());
        assert_eq!(monitor.monitored_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_task_monitor() {
        let harness = with_tenant(Harness::new());

        harness.controller.start_task("t1", "job").await.unwrap();
        assert!(harness.controller.stop_task("t1", "job").await);
        assert!(!harness.controller.stop_task("t1", "job").await);
        assert!(!harness.controller.add_task_tokens("t1", "job", 10).await);
        assert!(harness
            .controller
            .monitor()
            .check_now("t1", "job")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_restart_resets_task_state() {
        let harness = with_tenant(Harness::new());
        let monitor = harness.controller.monitor();

        harness.controller.start_task("t1", "job").await.unwrap();
        for _ in 0..4 {
            harness.controller.record_task_action("t1", "job", "search").await;
        }
        harness.controller.start_task("t1", "job").await.unwrap();
        harness.controller.record_task_action("t1", "job", "search").await;

        assert!(monitor.check_now("t1", "job").await.unwrap().is_none());
        assert_eq!(monitor.monitored_count().await, 1);
    }

    #[tokio::test]
    async fn test_restart_after_pause_is_watched_again() {
        let harness = with_tenant(Harness::new());
        let mut decisions = harness.controller.monitor().subscribe();

        harness.controller.start_task("t1", "job").await.unwrap();
        assert!(harness.controller.add_task_tokens("t1", "job", 20_000).await);
        let paused = timeout(Duration::from_secs(3), decisions.recv())
            .await
            .expect("pause emitted")
            .unwrap();
        assert_eq!(paused.action, WatchdogAction::Pause);

        // 等暂停任务的看门狗退出
        tokio::time::sleep(Duration::from_millis(1500)).await;

        harness.controller.start_task("t1", "job").await.unwrap();
        assert!(!harness.controller.monitor().is_paused("t1", "job").await);
        for _ in 0..5 {
            assert!(harness.controller.record_task_action("t1", "job", "retry").await);
        }

        let killed = timeout(Duration::from_secs(4), decisions.recv())
            .await
            .expect("kill emitted after restart")
            .unwrap();
        assert_eq!(killed.action, WatchdogAction::Kill);
        assert!(matches!(killed.reason, WatchdogReason::LoopDetected { .. }));
        assert_eq!(harness.audit.records().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_while_watched_emits_single_decision() {
        let harness = with_tenant(Harness::new());
        let mut decisions = harness.controller.monitor().subscribe();

        harness.controller.start_task("t1", "job").await.unwrap();
        harness.controller.start_task("t1", "job").await.unwrap();
        harness.controller.start_task("t1", "job").await.unwrap();
        assert!(harness.controller.add_task_tokens("t1", "job", 20_000).await);

        let decision = timeout(Duration::from_secs(3), decisions.recv())
            .await
            .expect("decision emitted")
            .unwrap();
        assert_eq!(decision.action, WatchdogAction::Pause);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(decisions.try_recv().is_err());
        assert_eq!(harness.audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_rejected() {
        let harness = Harness::new();
        assert!(matches!(
            harness.controller.start_task("missing", "job").await,
            Err(FleetError::TenantNotFound { .. })
        ));
        assert_eq!(harness.controller.monitor().monitored_count().await, 0);
    }
}
