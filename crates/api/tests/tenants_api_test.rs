mod common;

#[cfg(test)]
mod tests {
    use fleet_core::models::{PlanTier, TenantStatus};
    use fleet_testing_utils::TenantBuilder;
    use serde_json::{json, Value};

    use crate::common::TestApp;

    fn sleeping(id: &str) -> TenantBuilder {
        TenantBuilder::new()
            .with_id(id)
            .with_status(TenantStatus::Sleeping)
            .on_host("a")
    }

    #[tokio::test]
    async fn test_create_and_provision_tenant() {
        let app = TestApp::spawn().await;
        app.add_host("a", 8192, 0);

        let response = app
            .post("/internal/tenants")
            .json(&json!({
                "id": "t1",
                "plan_tier": "business",
                "contact": "owner@example.com",
                "channels": ["web"]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["plan_tier"], "business");

        let response = app.post("/internal/tenants/t1/provision").send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["status"], "active");
        assert_eq!(body["data"]["assigned_host_id"], "a");

        assert_eq!(app.store.host("a").unwrap().ram_used_mb, 4096);
        assert_eq!(app.remote.count_matching("docker run"), 1);

        let body: Value = app
            .get("/internal/tenants/t1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["id"], "t1");
        assert_eq!(body["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found() {
        let app = TestApp::spawn().await;

        let response = app.get("/internal/tenants/missing").send().await.unwrap();
        assert_eq!(response.status(), 404);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "TENANT_NOT_FOUND");

        let response = app.post("/internal/tenants/missing/wake").send().await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_blank_tenant_id_is_rejected() {
        let app = TestApp::spawn().await;

        let response = app
            .post("/internal/tenants")
            .json(&json!({ "id": " ", "plan_tier": "starter", "contact": "x@example.com" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_wake_sleeping_tenant() {
        let app = TestApp::spawn().await;
        app.add_host("a", 8192, 0);
        app.add_tenant(sleeping("t1").with_plan(PlanTier::Pro).build());

        let response = app.post("/internal/tenants/t1/wake").send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["outcome"], "woken");
        assert_eq!(app.store.host("a").unwrap().ram_used_mb, 2048);

        let body: Value = app
            .post("/internal/tenants/t1/wake")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["outcome"], "already_active");
        assert_eq!(app.remote.count_matching("docker start"), 1);

        let body: Value = app
            .get("/internal/tenants/t1/status")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["status"], "active");
    }

    #[tokio::test]
    async fn test_wake_paused_tenant_conflicts() {
        let app = TestApp::spawn().await;
        app.add_host("a", 8192, 0);
        app.add_tenant(
            TenantBuilder::new()
                .with_id("t1")
                .with_status(TenantStatus::Paused)
                .on_host("a")
                .build(),
        );

        let response = app.post("/internal/tenants/t1/wake").send().await.unwrap();
        assert_eq!(response.status(), 409);
        assert!(app.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_wake_surfaces_remote_error() {
        let app = TestApp::spawn().await;
        app.add_host("a", 8192, 0);
        app.add_tenant(sleeping("t1").build());
        app.remote.fail_on("docker start", "connection reset");

        let response = app.post("/internal/tenants/t1/wake").send().await.unwrap();
        assert_eq!(response.status(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["type"], "REMOTE_EXEC_FAILED");
        assert_eq!(body["error"]["retryable"], true);

        assert_eq!(app.store.tenant("t1").unwrap().status, TenantStatus::Sleeping);
        assert_eq!(app.store.host("a").unwrap().ram_used_mb, 0);
    }

    #[tokio::test]
    async fn test_touch_activity_is_debounced() {
        let app = TestApp::spawn().await;
        app.add_tenant(
            TenantBuilder::new()
                .with_id("t1")
                .with_status(TenantStatus::Active)
                .build(),
        );

        let body: Value = app
            .post("/internal/tenants/t1/activity")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["recorded"], true);

        let body: Value = app
            .post("/internal/tenants/t1/activity")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["recorded"], false);
    }

    #[tokio::test]
    async fn test_cancel_releases_capacity() {
        let app = TestApp::spawn().await;
        app.add_host("a", 8192, 2048);
        app.add_tenant(
            TenantBuilder::new()
                .with_id("t1")
                .with_status(TenantStatus::Active)
                .on_host("a")
                .build(),
        );

        let response = app.post("/internal/tenants/t1/cancel").send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["status"], "cancelled");
        assert!(body["data"]["cancelled_at"].is_string());
        assert_eq!(app.store.host("a").unwrap().ram_used_mb, 0);
    }
}
