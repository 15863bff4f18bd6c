//! # Fleet API
//!
//! 编排器的内部HTTP接口，供其他进程中的协作方调用：主机启动回调、入站流量路由、
//! 计费事件转发以及智能体执行器。
//!
//! ## API 端点
//!
//! ### 主机与容量
//! - `POST /internal/hosts/register` - 主机自注册（幂等）
//! - `GET /internal/hosts` - 主机列表
//! - `PUT /internal/hosts/{id}/status` - 修改主机状态（例如 draining）
//! - `DELETE /internal/hosts/{id}` - 移除空主机
//! - `GET /internal/capacity` - 集群容量汇总
//! - `POST /internal/capacity` - 预订内存
//!
//! ### 租户
//! - `POST /internal/tenants` - 创建租户
//! - `GET /internal/tenants/{id}` - 租户详情
//! - `GET /internal/tenants/{id}/status` - 租户状态（读缓存）
//! - `POST /internal/tenants/{id}/provision` - 分配主机并启动容器
//! - `POST /internal/tenants/{id}/wake` - 唤醒休眠容器
//! - `POST /internal/tenants/{id}/activity` - 记录活跃时间
//! - `POST /internal/tenants/{id}/cancel` - 取消订阅
//!
//! ### 计费与任务看门狗
//! - `POST /internal/billing/events` - 计费事件
//! - `POST /internal/tasks/{tenant}/{task}/start|stop|actions|tokens`
//! - `GET /internal/tasks/{tenant}/{task}` - 任务监控状态和最近一次判定
//!
//! 除 `GET /health` 外，所有 `/internal` 路由在配置了 `api.internal_token` 时
//! 都要求 `Authorization: Bearer <token>`。
//!
//! ## 响应格式
//!
//! ```json
//! {
//!   "success": true,
//!   "data": { "outcome": "woken", "status": "active" },
//!   "timestamp": "2024-01-01T00:00:00Z"
//! }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::DefaultBodyLimit, Router};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use fleet_core::config::ApiConfig;
use fleet_dispatcher::FleetController;
use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(controller: Arc<FleetController>, api_config: &ApiConfig) -> Router {
    let state = AppState {
        controller,
        internal_token: api_config
            .internal_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(Arc::from),
    };
    if state.internal_token.is_none() {
        warn!("未配置 api.internal_token，内部API不做鉴权，只应部署在私有网络");
    }

    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging))
            .layer(TimeoutLayer::new(Duration::from_secs(
                api_config.request_timeout_seconds,
            )))
            .layer(DefaultBodyLimit::max(
                api_config.max_request_size_mb * 1024 * 1024,
            )),
    )
}

/// 在指定地址上提供服务，`shutdown` 完成后停止接受新连接
pub async fn serve<F>(app: Router, bind_address: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("绑定地址失败: {bind_address}"))?;
    info!("内部API监听于 {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("内部API服务异常退出")
}
