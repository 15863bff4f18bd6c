mod common;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_core::{
        models::{HostRegistration, HostStatus, PlanTier, TenantStatus},
        FleetError,
    };
    use fleet_testing_utils::{HostBuilder, TenantBuilder, TestEnv};
    use futures::future::join_all;

    use crate::common::Harness;

    fn registration(address: &str, provider_id: Option<&str>) -> HostRegistration {
        HostRegistration {
            address: address.to_string(),
            ram_total_mb: 8192,
            hostname: "worker-a".to_string(),
            provider_id: provider_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_reserve_prefers_fullest_host() {
        let harness = Harness::new();
        harness.add_host("a", 8192, 6144);
        harness.add_host("b", 8192, 0);

        let host = harness.controller.request_capacity(2048, false).await.unwrap();
        assert_eq!(host.id, "a");
        assert_eq!(harness.ram_used("a"), 8192);

        // a 已满，下一次只能落到 b
        let host = harness.controller.request_capacity(2048, false).await.unwrap();
        assert_eq!(host.id, "b");
        assert_eq!(harness.ram_used("b"), 2048);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_never_overbook() {
        let harness = Harness::new();
        harness.add_host("a", 4096, 1024);
        harness.add_host("b", 4096, 1024);

        let results = join_all((0..20).map(|_| {
            let controller = harness.controller.clone();
            tokio::spawn(async move { controller.request_capacity(1024, false).await })
        }))
        .await;

        let mut succeeded = 0;
        let mut exhausted = 0;
        for result in results {
            match result.unwrap() {
                Ok(_) => succeeded += 1,
                Err(FleetError::CapacityExhausted { required_mb }) => {
                    assert_eq!(required_mb, 1024);
                    exhausted += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(succeeded, 6);
        assert_eq!(exhausted, 14);
        assert_eq!(harness.ram_used("a"), 4096);
        assert_eq!(harness.ram_used("b"), 4096);
    }

    #[tokio::test]
    async fn test_non_active_hosts_are_not_candidates() {
        let harness = Harness::new();
        harness.store.insert_host(
            HostBuilder::new()
                .with_id("draining")
                .with_status(HostStatus::Draining)
                .build(),
        );
        harness.store.insert_host(
            HostBuilder::new()
                .with_id("offline")
                .with_status(HostStatus::Offline)
                .build(),
        );

        let err = harness.controller.request_capacity(1024, false).await.unwrap_err();
        assert!(matches!(err, FleetError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn test_invalid_reservation_rejected() {
        let harness = Harness::new();
        harness.add_host("a", 8192, 0);

        let err = harness.controller.request_capacity(0, false).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidInput(_)));
        assert_eq!(harness.ram_used("a"), 0);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_by_address() {
        let harness = Harness::new();

        let first = harness
            .controller
            .register_host(registration("10.1.0.5", Some("srv-9")))
            .await
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.host.status, HostStatus::Active);
        assert_eq!(first.host.ram_used_mb, 0);

        let again = harness
            .controller
            .register_host(registration("10.1.0.5", None))
            .await
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(again.host.id, first.host.id);
        assert_eq!(again.host.provider_id.as_deref(), Some("srv-9"));
        assert_eq!(harness.store.host_count(), 1);

        // 只有首次注册触发镜像预热
        let remote = harness.remote.clone();
        assert!(
            TestEnv::wait_for(
                || {
                    let remote = remote.clone();
                    async move { remote.count_matching("docker pull") == 1 }
                },
                Duration::from_secs(2)
            )
            .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.remote.count_matching("docker pull"), 1);
    }

    #[tokio::test]
    async fn test_register_blank_provider_id_is_dropped() {
        let harness = Harness::new();
        let registered = harness
            .controller
            .register_host(registration("10.1.0.6", Some("  ")))
            .await
            .unwrap();
        assert_eq!(registered.host.provider_id, None);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_payload() {
        let harness = Harness::new();

        let mut missing_address = registration("", None);
        missing_address.address = "  ".to_string();
        assert!(matches!(
            harness.controller.register_host(missing_address).await,
            Err(FleetError::InvalidInput(_))
        ));

        let mut no_ram = registration("10.1.0.7", None);
        no_ram.ram_total_mb = 0;
        assert!(matches!(
            harness.controller.register_host(no_ram).await,
            Err(FleetError::InvalidInput(_))
        ));
        assert_eq!(harness.store.host_count(), 0);
    }

    #[tokio::test]
    async fn test_recompute_heals_drift() {
        let harness = Harness::new();
        harness.add_host("a", 8192, 7000);
        harness.add_tenant(
            TenantBuilder::new()
                .with_id("running")
                .with_plan(PlanTier::Pro)
                .with_status(TenantStatus::Active)
                .on_host("a")
                .build(),
        );
        harness.add_tenant(
            TenantBuilder::new()
                .with_id("asleep")
                .with_plan(PlanTier::Business)
                .with_status(TenantStatus::Sleeping)
                .on_host("a")
                .build(),
        );
        harness.add_tenant(
            TenantBuilder::new()
                .with_id("grace")
                .with_plan(PlanTier::Starter)
                .with_status(TenantStatus::GracePeriod)
                .on_host("a")
                .build(),
        );

        let recomputed = harness.controller.registry().recompute("a").await.unwrap();
        assert_eq!(recomputed, Some(2048 + 1024));
        assert_eq!(harness.ram_used("a"), 3072);

        assert_eq!(harness.controller.registry().recompute("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_host_requires_no_assigned_tenants() {
        let harness = Harness::new();
        harness
            .store
            .insert_host(HostBuilder::new().with_id("a").with_provider_id("srv-1").build());
        harness.add_tenant(
            TenantBuilder::new()
                .with_id("t1")
                .with_status(TenantStatus::Cancelled)
                .on_host("a")
                .build(),
        );

        let err = harness.controller.remove_host("a").await.unwrap_err();
        assert!(matches!(err, FleetError::HostInUse { assigned: 1, .. }));

        harness
            .store
            .update_tenant("t1", |tenant| tenant.status = TenantStatus::Purged);
        let removed = harness.controller.remove_host("a").await.unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(harness.cloud.deleted(), vec!["srv-1".to_string()]);

        let err = harness.controller.remove_host("a").await.unwrap_err();
        assert!(matches!(err, FleetError::HostNotFound { .. }));
    }

    #[tokio::test]
    async fn test_set_host_status_takes_host_out_of_rotation() {
        let harness = Harness::new();
        harness.add_host("a", 8192, 0);

        let host = harness
            .controller
            .set_host_status("a", HostStatus::Draining)
            .await
            .unwrap();
        assert_eq!(host.status, HostStatus::Draining);
        assert!(!harness.controller.registry().has_headroom(1024).await.unwrap());

        let err = harness
            .controller
            .set_host_status("missing", HostStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::HostNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fleet_capacity_counts_active_hosts_only() {
        let harness = Harness::new();
        harness.add_host("a", 8192, 2048);
        harness.add_host("b", 4096, 1024);
        harness.store.insert_host(
            HostBuilder::new()
                .with_id("c")
                .with_ram(16384, 0)
                .with_status(HostStatus::Offline)
                .build(),
        );

        let fleet = harness.controller.registry().refresh_fleet_metrics().await.unwrap();
        assert_eq!(fleet.active_hosts, 2);
        assert_eq!(fleet.ram_total_mb, 12288);
        assert_eq!(fleet.ram_booked_mb, 3072);
        assert_eq!(fleet.headroom_mb(), 9216);
    }
}
