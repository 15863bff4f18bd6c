use async_trait::async_trait;
use fleet_core::{
    config::CloudConfig,
    errors::{FleetError, Result},
    traits::{CloudProvisioner, CreatedHost, HostCreateRequest},
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: ServerInfo,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    id: serde_json::Value,
    name: String,
}

/// 云服务商 HTTP API 客户端
pub struct HttpCloudProvisioner {
    client: reqwest::Client,
    api_url: String,
    api_token: String,
}

impl HttpCloudProvisioner {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| FleetError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl CloudProvisioner for HttpCloudProvisioner {
    async fn create_host(&self, request: &HostCreateRequest) -> Result<CreatedHost> {
        let body = serde_json::json!({
            "name": request.name,
            "server_type": request.server_type,
            "image": request.image,
            "location": request.region,
            "user_data": request.user_data,
        });

        let response = self
            .client
            .post(format!("{}/servers", self.api_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::Provisioning(format!(
                "云服务商返回 {status}: {text}"
            )));
        }

        let parsed: ServerResponse = response
            .json()
            .await
            .map_err(|e| FleetError::Serialization(e.to_string()))?;

        let provider_id = match parsed.server.id {
            serde_json::Value::String(id) => id,
            other => other.to_string(),
        };
        info!("云服务商已创建主机: {} ({})", parsed.server.name, provider_id);

        Ok(CreatedHost {
            provider_id,
            name: parsed.server.name,
        })
    }

    async fn delete_host(&self, provider_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/servers/{}", self.api_url, provider_id))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| FleetError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            warn!("云服务商主机 {} 已不存在", provider_id);
            return Ok(());
        }
        if !status.is_success() {
            return Err(FleetError::Provisioning(format!(
                "删除主机 {provider_id} 失败: {status}"
            )));
        }

        info!("云服务商主机已删除: {}", provider_id);
        Ok(())
    }
}
