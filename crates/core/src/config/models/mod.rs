pub mod api_observability;
pub mod app_config;
pub mod capacity;
pub mod database;
pub mod integrations;
pub mod lifecycle;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use capacity::{CapacityConfig, ProvisioningConfig};
pub use database::{CacheConfig, DatabaseConfig};
pub use integrations::{CloudConfig, GatewayConfig, NotificationConfig, RemoteConfig};
pub use lifecycle::{GraceConfig, LifecycleConfig, WatchdogConfig};
