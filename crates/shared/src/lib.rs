//! 共享库
//!
//! 包含各入口共用的配置加载与日志初始化代码。

pub mod config;
pub mod observability;

pub use config::{AppConfig, EngineConfig, FormulaSettings, LayerSettings, ObservabilityConfig};

/// 加载配置并初始化日志
///
/// 返回的配置供调用方构造引擎组件。
pub fn bootstrap(service_name: &str) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load(service_name)?;
    observability::init(service_name, &config.observability)?;
    Ok(config)
}
