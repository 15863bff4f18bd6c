pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;
