use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use fleet_core::models::{NewTenant, TenantStatus};
use fleet_dispatcher::WakeOutcome;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

pub async fn create_tenant(
    State(state): State<AppState>,
    Json(new_tenant): Json<NewTenant>,
) -> ApiResult<impl IntoResponse> {
    Ok(created(state.controller.create_tenant(new_tenant).await?))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.get_tenant(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct TenantStatusResponse {
    pub tenant_id: String,
    pub status: TenantStatus,
}

/// 入站路由判断是否需要唤醒时调用，优先读缓存
pub async fn get_tenant_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state.controller.tenant_status(&id).await?;
    Ok(success(TenantStatusResponse {
        tenant_id: id,
        status,
    }))
}

pub async fn provision_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.provision_tenant(&id).await?))
}

#[derive(Debug, Serialize)]
pub struct WakeResponse {
    pub tenant_id: String,
    /// woken | already_active
    pub outcome: &'static str,
}

/// 唤醒休眠容器；当前状态不允许唤醒时返回 409
pub async fn wake_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = match state.controller.wake(&id).await? {
        WakeOutcome::Woken => "woken",
        WakeOutcome::AlreadyActive => "already_active",
        WakeOutcome::CannotWake(status) => {
            return Err(ApiError::Conflict(format!(
                "租户 {id} 当前状态为 {status}，无法唤醒"
            )))
        }
    };

    Ok(success(WakeResponse {
        tenant_id: id,
        outcome,
    }))
}

#[derive(Debug, Serialize)]
pub struct TouchResponse {
    /// 是否真正写入（去抖窗口内的重复调用返回 false）
    pub recorded: bool,
}

pub async fn touch_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let recorded = state.controller.touch_activity(&id).await?;
    Ok(success(TouchResponse { recorded }))
}

pub async fn cancel_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.cancel_tenant(&id).await?))
}
