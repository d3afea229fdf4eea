//! 统一可观测性模块
//!
//! 提供日志初始化和引擎指标描述。
//! 所有宿主通过单一入口点配置可观测性，确保一致的日志格式和指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use serde::Deserialize;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识日志来源
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// 日志级别（如 "info", "debug"），`RUST_LOG` 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    #[serde(default)]
    pub json_logs: bool,
}

fn default_service_name() -> String {
    "unknown-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 从环境变量加载配置
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level()),
            json_logs: std::env::var("JSON_LOGS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 可观测性资源守卫
///
/// 持有期间日志订阅器保持安装，drop 时记录关闭日志。
pub struct ObservabilityGuard {
    service_name: String,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        info!(service = %self.service_name, "Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（指标描述，导出器由宿主自行安装）
///
/// # Example
///
/// ```ignore
/// use condition_shared::observability::{init, ObservabilityConfig};
///
/// fn main() -> anyhow::Result<()> {
///     let config = ObservabilityConfig::from_env("condition-engine");
///     let _guard = init(&config)?;
///
///     // 应用逻辑...
///
///     Ok(())
/// }
/// ```
pub fn init(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;
    metrics::describe_engine_metrics();

    info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Observability initialized"
    );

    Ok(ObservabilityGuard {
        service_name: config.service_name.clone(),
    })
}
