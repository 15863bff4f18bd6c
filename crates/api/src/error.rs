use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::FleetError;
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("编排器错误: {0}")]
    Fleet(#[from] FleetError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求冲突: {0}")]
    Conflict(String),

    #[error("缺少或无效的内部令牌")]
    Unauthorized,
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Fleet(err) => match err {
                FleetError::HostNotFound { .. } => (StatusCode::NOT_FOUND, "HOST_NOT_FOUND"),
                FleetError::TenantNotFound { .. } => (StatusCode::NOT_FOUND, "TENANT_NOT_FOUND"),
                FleetError::CapacityExhausted { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXHAUSTED")
                }
                FleetError::HostInUse { .. } => (StatusCode::CONFLICT, "HOST_IN_USE"),
                FleetError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                FleetError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
                FleetError::RemoteExec { .. } => (StatusCode::BAD_GATEWAY, "REMOTE_EXEC_FAILED"),
                FleetError::HealthCheckTimeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "HEALTH_CHECK_TIMEOUT")
                }
                FleetError::ProvisioningTimeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "PROVISIONING_TIMEOUT")
                }
                FleetError::Provisioning(_) => (StatusCode::BAD_GATEWAY, "PROVISIONING_FAILED"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ApiError::Fleet(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        // 内部错误只记录详情，对外返回通用信息
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("请求处理失败: {}", self);
            "系统内部错误".to_string()
        } else {
            if status.is_server_error() {
                warn!("请求处理失败: {}", self);
            }
            match &self {
                ApiError::Fleet(err) => err.to_string(),
                other => other.to_string(),
            }
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "retryable": self.retryable(),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_error_conversion() {
        let api_error: ApiError = FleetError::TenantNotFound {
            id: "t-1".to_string(),
        }
        .into();

        match api_error {
            ApiError::Fleet(FleetError::TenantNotFound { id }) => assert_eq!(id, "t-1"),
            _ => panic!("Expected FleetError::TenantNotFound"),
        }
    }

    #[test]
    fn test_not_found_status() {
        let response = ApiError::from(FleetError::HostNotFound {
            id: "h-1".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_capacity_exhausted_is_service_unavailable() {
        let error = ApiError::from(FleetError::CapacityExhausted { required_mb: 2048 });
        assert!(error.retryable());
        assert_eq!(error.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_conflict_statuses() {
        let in_use = ApiError::from(FleetError::HostInUse {
            id: "h-1".to_string(),
            assigned: 2,
        });
        assert_eq!(in_use.into_response().status(), StatusCode::CONFLICT);

        let transition = ApiError::from(FleetError::InvalidTransition {
            tenant_id: "t-1".to_string(),
            from: "purged".to_string(),
            action: "cancel".to_string(),
        });
        assert_eq!(transition.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_timeouts_map_to_gateway_timeout() {
        let error = ApiError::from(FleetError::ProvisioningTimeout { waited_secs: 600 });
        assert_eq!(error.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_remote_failure_is_bad_gateway() {
        let error = ApiError::from(FleetError::remote("10.0.0.5", "connection refused"));
        assert!(error.retryable());
        assert_eq!(error.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_unauthorized() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let error = ApiError::from(FleetError::Internal("pool poisoned".to_string()));
        assert!(!error.retryable());
        assert_eq!(
            error.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ApiError::BadRequest("tokens".to_string()).to_string(),
            "请求参数错误: tokens"
        );
    }
}
