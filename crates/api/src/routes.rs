use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

use fleet_dispatcher::FleetController;

use crate::handlers::{
    billing::handle_billing_event,
    health::health_check,
    hosts::{
        fleet_capacity, list_hosts, register_host, remove_host, request_capacity, set_host_status,
    },
    tasks::{add_tokens, get_task, record_action, start_task, stop_task},
    tenants::{
        cancel_tenant, create_tenant, get_tenant, get_tenant_status, provision_tenant,
        touch_activity, wake_tenant,
    },
};
use crate::middleware::require_internal_token;

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FleetController>,
    pub internal_token: Option<Arc<str>>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    let internal = Router::new()
        // 主机与容量
        .route("/hosts", get(list_hosts))
        .route("/hosts/register", post(register_host))
        .route("/hosts/{id}", delete(remove_host))
        .route("/hosts/{id}/status", put(set_host_status))
        .route("/capacity", get(fleet_capacity).post(request_capacity))
        // 租户生命周期
        .route("/tenants", post(create_tenant))
        .route("/tenants/{id}", get(get_tenant))
        .route("/tenants/{id}/status", get(get_tenant_status))
        .route("/tenants/{id}/provision", post(provision_tenant))
        .route("/tenants/{id}/wake", post(wake_tenant))
        .route("/tenants/{id}/activity", post(touch_activity))
        .route("/tenants/{id}/cancel", post(cancel_tenant))
        // 计费事件
        .route("/billing/events", post(handle_billing_event))
        // 任务看门狗
        .route("/tasks/{tenant_id}/{task_id}", get(get_task))
        .route("/tasks/{tenant_id}/{task_id}/start", post(start_task))
        .route("/tasks/{tenant_id}/{task_id}/stop", post(stop_task))
        .route("/tasks/{tenant_id}/{task_id}/actions", post(record_action))
        .route("/tasks/{tenant_id}/{task_id}/tokens", post(add_tokens))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/internal", internal)
        .with_state(state)
}
