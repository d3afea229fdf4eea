//! 条件引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("条件结构错误 [{node}]: {message}")]
    Structural { node: String, message: String },

    #[error("未知的操作符: {0}")]
    UnknownOperator(String),

    #[error("未知的条件类型: {0}")]
    UnknownType(String),

    #[error("未知的变换类型: {0}")]
    UnknownMutation(String),

    #[error("取值失败 {source_spec}: {message}")]
    SourceResolution {
        source_spec: String,
        message: String,
    },

    #[error("无效的正则表达式 '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("条件未找到: {0}")]
    ConditionNotFound(String),

    #[error("规则解析失败: {0}")]
    ParseError(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RuleError {
    pub fn structural(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Structural {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, err: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: err.to_string(),
        }
    }

    /// 条件树本身不合法（而非运行时取值失败）
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Structural { .. }
                | Self::UnknownOperator(_)
                | Self::UnknownType(_)
                | Self::UnknownMutation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
