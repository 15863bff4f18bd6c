use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use fleet_core::models::BillingEvent;

use crate::{error::ApiResult, response::success, routes::AppState};

#[derive(Debug, Serialize)]
pub struct BillingEventResponse {
    pub tenant_id: String,
    /// 事件是否改变了租户状态；重复投递返回 false
    pub applied: bool,
}

pub async fn handle_billing_event(
    State(state): State<AppState>,
    Json(event): Json<BillingEvent>,
) -> ApiResult<impl IntoResponse> {
    let applied = state.controller.handle_billing_event(&event).await?;
    Ok(success(BillingEventResponse {
        tenant_id: event.tenant_id().to_string(),
        applied,
    }))
}
