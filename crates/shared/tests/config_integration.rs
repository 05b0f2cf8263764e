//! 配置加载集成测试
//!
//! 覆盖服务特定配置文件与环境变量两层覆盖。

use std::fs;
use valuation_shared::config::AppConfig;

#[test]
fn test_service_file_overrides_environment_file() {
    let dir = std::env::temp_dir().join(format!("valuation-shared-it-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("production.toml"), "[engine.formula]\nmax_depth = 16\nwarn_depth = 6\n").unwrap();
    fs::write(dir.join("valuation-engine.toml"), "[engine.formula]\nmax_depth = 12\n").unwrap();

    let config = AppConfig::load_from(&dir, "valuation-engine", "production").unwrap();
    assert!(config.is_production());
    assert_eq!(config.engine.formula.max_depth, 12);
    assert_eq!(config.engine.formula.warn_depth, 6);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_environment_variables_override_files() {
    let dir = std::env::temp_dir().join(format!("valuation-shared-env-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("default.toml"), "[engine.layers]\nbasic_max_priority = 10\n").unwrap();

    // SAFETY: 该变量只在本测试中使用
    unsafe {
        std::env::set_var("VALUATION_ENGINE__LAYERS__BASIC_MAX_PRIORITY", "15");
    }
    let config = AppConfig::load_from(&dir, "valuation-engine", "development").unwrap();
    unsafe {
        std::env::remove_var("VALUATION_ENGINE__LAYERS__BASIC_MAX_PRIORITY");
    }

    assert_eq!(config.engine.layers.basic_max_priority, 15);
    fs::remove_dir_all(&dir).ok();
}
