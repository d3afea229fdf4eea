//! 条件引擎命令行
//!
//! 从文件加载条件和记录，输出评估追踪或结构哈希。

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use condition_engine::{Condition, ConditionDef, EngineContext, Environment};
use condition_shared::config::AppConfig;
use condition_shared::observability::{self, ObservabilityConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const SERVICE_NAME: &str = "condition-engine";

#[derive(Parser, Debug)]
#[command(name = "condition-engine")]
#[command(version, about = "声明式条件引擎")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 对记录评估条件，输出 JSON 追踪
    Evaluate {
        /// 条件定义文件
        #[arg(short, long)]
        condition: PathBuf,

        /// 记录文件
        #[arg(short, long)]
        record: PathBuf,

        /// 环境变量文件（JSON 对象）
        #[arg(short, long)]
        env: Option<PathBuf>,

        /// 格式化输出
        #[arg(long)]
        pretty: bool,
    },

    /// 输出条件的结构哈希
    Hash {
        /// 条件定义文件
        #[arg(short, long)]
        condition: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            observability: ObservabilityConfig::from_env(SERVICE_NAME),
            ..AppConfig::default()
        }
    });

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    let context = Arc::new(EngineContext::from_config(&config.engine));

    match cli.command {
        Commands::Evaluate {
            condition,
            record,
            env,
            pretty,
        } => {
            let condition = load_condition(&condition, context, config.engine.max_depth)?;
            let record = read_json(&record)?;
            let environment = match env {
                Some(path) => match read_json(&path)? {
                    Value::Object(map) => map,
                    _ => bail!("环境文件必须是 JSON 对象: {}", path.display()),
                },
                None => Environment::new(),
            };

            let result = condition
                .evaluate(&record, &environment)
                .context("条件评估失败")?;
            info!(result = result.result, "评估完成");

            let output = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{}", output);
        }
        Commands::Hash { condition } => {
            let condition = load_condition(&condition, context, config.engine.max_depth)?;
            println!("{}", condition.structural_hash());
        }
    }

    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取文件失败: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("JSON 解析失败: {}", path.display()))
}

/// 加载条件并检查树深度
fn load_condition(path: &Path, context: Arc<EngineContext>, max_depth: usize) -> Result<Condition> {
    let def: ConditionDef = serde_json::from_value(read_json(path)?)
        .with_context(|| format!("条件格式错误: {}", path.display()))?;
    let condition = Condition::from_def_with_context(&def, context)
        .with_context(|| format!("条件构建失败: {}", path.display()))?;

    let depth = condition.depth();
    if depth > max_depth {
        bail!("条件树深度 {} 超过上限 {}", depth, max_depth);
    }

    info!(path = %path.display(), depth, "条件已加载");
    Ok(condition)
}
