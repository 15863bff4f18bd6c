mod common;

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use fleet_testing_utils::{HostBuilder, TestEnv};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::common::{build_app, TEST_TOKEN};

    fn router() -> (Router, fleet_testing_utils::InMemoryFleetStore) {
        let mut config = TestEnv::fast_config();
        config.api.internal_token = Some(TEST_TOKEN.to_string());
        let (app, parts) = build_app(&config);
        (app, parts.store)
    }

    fn authorized(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_without_token() {
        let (app, _) = router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["service"], "fleet");
    }

    #[tokio::test]
    async fn test_lowercase_bearer_scheme_rejected() {
        let (app, _) = router();

        let request = Request::builder()
            .uri("/internal/hosts")
            .header(header::AUTHORIZATION, format!("bearer{TEST_TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (app, _) = router();

        let response = app
            .oneshot(authorized("GET", "/internal/nothing-here", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_registration_rejected() {
        let (app, store) = router();

        let request = Request::builder()
            .method("POST")
            .uri("/internal/hosts/register")
            .header(header::AUTHORIZATION, format!("Bearer {TEST_TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"address\": "))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(store.host_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_exhausted_body_shape() {
        let (app, store) = router();
        store.insert_host(HostBuilder::new().with_id("h-full").with_ram(4096, 4096).build());

        let response = app
            .oneshot(authorized(
                "POST",
                "/internal/capacity",
                Some(json!({ "ram_mb": 1024 })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["type"], "CAPACITY_EXHAUSTED");
        assert_eq!(body["error"]["code"], 503);
        assert_eq!(body["error"]["retryable"], true);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_reserve_returns_success_envelope() {
        let (app, store) = router();
        store.insert_host(HostBuilder::new().with_id("h-1").with_ram(8192, 6144).build());

        let response = app
            .oneshot(authorized(
                "POST",
                "/internal/capacity",
                Some(json!({ "ram_mb": 2048 })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], "h-1");
        assert_eq!(store.host("h-1").unwrap().ram_used_mb, 8192);
    }
}
