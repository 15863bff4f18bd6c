use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub tenant_id: String,
    pub task_id: String,
    /// 任务是否仍在监控中，被 kill 后为 false
    pub monitored: bool,
    /// 任务已因 token 预算被暂停
    pub paused: bool,
}

impl MonitorResponse {
    fn new(tenant_id: String, task_id: String, monitored: bool) -> Self {
        Self {
            tenant_id,
            task_id,
            monitored,
            paused: false,
        }
    }

    async fn with_pause_state(mut self, state: &AppState) -> Self {
        if self.monitored {
            self.paused = state
                .controller
                .task_paused(&self.tenant_id, &self.task_id)
                .await;
        }
        self
    }
}

pub async fn start_task(
    State(state): State<AppState>,
    Path((tenant_id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.controller.start_task(&tenant_id, &task_id).await?;
    Ok(success(MonitorResponse::new(tenant_id, task_id, true)))
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path((tenant_id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    // 已经停止的任务返回 monitored = false，不视为错误
    state.controller.stop_task(&tenant_id, &task_id).await;
    Ok(success(MonitorResponse::new(tenant_id, task_id, false)))
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action_type: String,
}

pub async fn record_action(
    State(state): State<AppState>,
    Path((tenant_id, task_id)): Path<(String, String)>,
    Json(request): Json<ActionRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.action_type.trim().is_empty() {
        return Err(ApiError::BadRequest("action_type 不能为空".to_string()));
    }
    let monitored = state
        .controller
        .record_task_action(&tenant_id, &task_id, &request.action_type)
        .await;
    let response = MonitorResponse::new(tenant_id, task_id, monitored)
        .with_pause_state(&state)
        .await;
    Ok(success(response))
}

#[derive(Debug, Deserialize)]
pub struct TokensRequest {
    pub tokens: u64,
}

pub async fn add_tokens(
    State(state): State<AppState>,
    Path((tenant_id, task_id)): Path<(String, String)>,
    Json(request): Json<TokensRequest>,
) -> ApiResult<impl IntoResponse> {
    let monitored = state
        .controller
        .add_task_tokens(&tenant_id, &task_id, request.tokens)
        .await;
    let response = MonitorResponse::new(tenant_id, task_id, monitored)
        .with_pause_state(&state)
        .await;
    Ok(success(response))
}

/// 执行器轮询任务状态：是否仍在监控、是否暂停，以及最近一次判定
pub async fn get_task(
    State(state): State<AppState>,
    Path((tenant_id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let status = state.controller.task_status(&tenant_id, &task_id).await?;
    Ok(success(status))
}
