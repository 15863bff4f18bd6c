use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use fleet_core::models::{HostRegistration, HostStatus};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

/// 主机自注册，首次注册返回 201
pub async fn register_host(
    State(state): State<AppState>,
    Json(registration): Json<HostRegistration>,
) -> ApiResult<Response> {
    let registered = state.controller.register_host(registration).await?;
    if registered.is_new {
        Ok(created(registered).into_response())
    } else {
        Ok(success(registered).into_response())
    }
}

pub async fn list_hosts(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.list_hosts().await?))
}

/// 主机状态修改请求
#[derive(Debug, Deserialize)]
pub struct HostStatusRequest {
    pub status: String,
}

pub async fn set_host_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<HostStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = request
        .status
        .parse::<HostStatus>()
        .map_err(ApiError::BadRequest)?;
    Ok(success(state.controller.set_host_status(&id, status).await?))
}

pub async fn remove_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.remove_host(&id).await?))
}

pub async fn fleet_capacity(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.fleet_capacity().await?))
}

/// 内存预订请求
#[derive(Debug, Deserialize)]
pub struct CapacityRequest {
    pub ram_mb: i64,
    #[serde(default)]
    pub allow_create: bool,
}

pub async fn request_capacity(
    State(state): State<AppState>,
    Json(request): Json<CapacityRequest>,
) -> ApiResult<impl IntoResponse> {
    let host = state
        .controller
        .request_capacity(request.ram_mb, request.allow_create)
        .await?;
    Ok(success(host))
}
