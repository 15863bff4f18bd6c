//! 编排器配置
//!
//! 配置来源按优先级从低到高：内置默认值、TOML配置文件、`FLEET__` 前缀的环境变量。
//! 每个配置段都提供 `validate()`，加载完成后统一校验。

pub mod models;

pub use models::*;
