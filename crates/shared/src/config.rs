//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 规则集分层阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LayerSettings {
    /// 优先级不高于此值的规则集属于基线层
    pub baseline_max_priority: i32,
    /// 优先级不高于此值的规则集属于基础层，更高的属于高级层
    pub basic_max_priority: i32,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            baseline_max_priority: 5,
            basic_max_priority: 10,
        }
    }
}

/// 公式校验限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FormulaSettings {
    /// 超过即拒绝
    pub max_depth: usize,
    /// 超过即给出警告
    pub warn_depth: usize,
    /// 编译缓存最多保留的公式条数
    pub cache_capacity: usize,
}

impl Default for FormulaSettings {
    fn default() -> Self {
        Self {
            max_depth: 32,
            warn_depth: 8,
            cache_capacity: 1024,
        }
    }
}

/// 估值引擎配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 当前应用版本，用于规则包兼容性检查
    pub app_version: String,
    pub layers: LayerSettings,
    pub formula: FormulaSettings,
    /// 命中规则是否附带逐条件的求值轨迹
    pub trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            layers: LayerSettings::default(),
            formula: FormulaSettings::default(),
            trace: true,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env（仅填充尚未设置的环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（VALUATION_ 前缀，双下划线分隔层级，如
    ///    VALUATION_ENGINE__LAYERS__BASIC_MAX_PRIORITY -> engine.layers.basic_max_priority）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = std::env::var("VALUATION_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, service_name: &str, env: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", service_name))).required(false))
            .add_source(
                Environment::with_prefix("VALUATION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
