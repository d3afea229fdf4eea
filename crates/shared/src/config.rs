//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use crate::observability::ObservabilityConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 路径查询缓存上限，为空时不限制
    pub path_cache_capacity: Option<usize>,
    /// STRING 变换未指定区域时使用
    pub default_locale: String,
    /// 条件树最大深度，超过时宿主拒绝编译
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path_cache_capacity: None,
            default_locale: "en-US".to_string(),
            max_depth: 64,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "condition-engine".to_string(),
            environment: "development".to_string(),
            engine: EngineConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CONDITION_ 前缀，`__` 分隔层级，如 CONDITION_ENGINE__MAX_DEPTH -> engine.max_depth）
    ///
    /// 环境名取自 `CONDITION_ENV`，配置目录取自 `CONFIG_DIR`。
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CONDITION_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    /// 从指定目录和环境名加载配置
    pub fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 字段名本身含下划线，层级分隔用双下划线
            .add_source(
                Environment::with_prefix("CONDITION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("condition-config-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.max_depth, 64);
        assert_eq!(config.engine.default_locale, "en-US");
        assert!(config.engine.path_cache_capacity.is_none());
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn test_load_without_files() {
        let config = AppConfig::load_from(
            "condition-engine",
            "development",
            Path::new("/nonexistent-condition-config"),
        )
        .unwrap();
        assert_eq!(config.service_name, "condition-engine");
        assert_eq!(config.environment, "development");
        assert_eq!(config.engine.max_depth, 64);
    }

    #[test]
    fn test_load_layers_files() {
        let dir = config_dir("layers");
        std::fs::write(
            dir.join("default.toml"),
            "[engine]\nmax_depth = 32\ndefault_locale = \"de-DE\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("staging.toml"), "[engine]\nmax_depth = 16\n").unwrap();
        std::fs::write(dir.join("rules-host.toml"), "[engine]\npath_cache_capacity = 128\n").unwrap();

        let config = AppConfig::load_from("rules-host", "staging", &dir).unwrap();
        assert_eq!(config.service_name, "rules-host");
        assert_eq!(config.environment, "staging");
        assert_eq!(config.engine.max_depth, 16);
        assert_eq!(config.engine.default_locale, "de-DE");
        assert_eq!(config.engine.path_cache_capacity, Some(128));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
