use serde::{Deserialize, Serialize};

/// 远程命令执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 通知模板类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentFailed,
    ServicePaused,
    ServiceCancelled,
    PaymentRecovered,
    DataPurged,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentFailed => "payment_failed",
            NotificationKind::ServicePaused => "service_paused",
            NotificationKind::ServiceCancelled => "service_cancelled",
            NotificationKind::PaymentRecovered => "payment_recovered",
            NotificationKind::DataPurged => "data_purged",
        }
    }
}

/// 计费系统推送的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    PaymentFailed { tenant_id: String },
    PaymentRecovered { tenant_id: String },
    SubscriptionCancelled { tenant_id: String },
}

impl BillingEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            BillingEvent::PaymentFailed { tenant_id }
            | BillingEvent::PaymentRecovered { tenant_id }
            | BillingEvent::SubscriptionCancelled { tenant_id } => tenant_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_deserialize() {
        let event: BillingEvent =
            serde_json::from_str(r#"{"type":"payment_failed","tenant_id":"t-9"}"#).unwrap();
        assert_eq!(
            event,
            BillingEvent::PaymentFailed {
                tenant_id: "t-9".to_string()
            }
        );
        assert_eq!(event.tenant_id(), "t-9");
    }
}
