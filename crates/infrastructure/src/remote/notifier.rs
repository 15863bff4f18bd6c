use async_trait::async_trait;
use fleet_core::{
    config::NotificationConfig,
    errors::{FleetError, Result},
    models::NotificationKind,
    traits::{CredentialRevoker, Notifier},
};
use std::time::Duration;
use tracing::{info, warn};

fn build_client(timeout_seconds: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| FleetError::Network(e.to_string()))
}

/// 通过 webhook 投递通知，未配置地址时只记录日志
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    api_token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout_seconds)?,
            webhook_url: config.webhook_url.clone(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        contact: &str,
        kind: NotificationKind,
        context: &serde_json::Value,
    ) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            info!("通知未配置投递地址，跳过: {} -> {}", kind.as_str(), contact);
            return Ok(());
        };

        let body = serde_json::json!({
            "to": contact,
            "template": kind.as_str(),
            "context": context,
        });

        let mut request = self.client.post(url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FleetError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FleetError::Network(format!(
                "通知投递失败: {}",
                response.status()
            )));
        }

        info!("已发送通知 {} -> {}", kind.as_str(), contact);
        Ok(())
    }
}

/// 通过模型代理的管理接口吊销租户凭据
pub struct HttpCredentialRevoker {
    client: reqwest::Client,
    revoke_url: Option<String>,
    api_token: Option<String>,
}

impl HttpCredentialRevoker {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout_seconds)?,
            revoke_url: config.credential_revoke_url.clone(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl CredentialRevoker for HttpCredentialRevoker {
    async fn revoke(&self, tenant_id: &str) -> Result<()> {
        let Some(template) = &self.revoke_url else {
            warn!("未配置凭据吊销地址，跳过租户 {} 的凭据吊销", tenant_id);
            return Ok(());
        };
        let url = template.replace("{tenant_id}", tenant_id);

        let mut request = self.client.delete(&url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FleetError::Network(e.to_string()))?;

        // 重复吊销返回404视为成功
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            info!("租户 {} 的外部凭据已吊销", tenant_id);
            Ok(())
        } else {
            Err(FleetError::Network(format!("吊销凭据失败: {status}")))
        }
    }
}
