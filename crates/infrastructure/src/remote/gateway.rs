use async_trait::async_trait;
use fleet_core::{
    config::GatewayConfig,
    errors::Result,
    models::Tenant,
    traits::GatewayConfigSource,
};

/// 由配置和租户数据生成权威网关配置
pub struct StaticGatewayConfigSource {
    model_proxy_url: String,
}

impl StaticGatewayConfigSource {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            model_proxy_url: config.model_proxy_url.clone(),
        }
    }
}

#[async_trait]
impl GatewayConfigSource for StaticGatewayConfigSource {
    async fn authoritative_config(&self, tenant: &Tenant) -> Result<serde_json::Value> {
        let channels: Vec<&str> = tenant.channels.iter().map(|c| c.as_str()).collect();
        Ok(serde_json::json!({
            "tenant_id": tenant.id,
            "plan": tenant.plan_tier.as_str(),
            "model_proxy": {
                "base_url": self.model_proxy_url,
                "tenant_header": "X-Tenant-Id",
            },
            "channels": channels,
        }))
    }
}
