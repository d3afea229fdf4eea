//! 条件引擎领域模型

use crate::error::{Result, RuleError};
use crate::operators::Operator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// 评估环境：变量名到值的映射
pub type Environment = Map<String, Value>;

/// 条件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
    Primitive,
    Date,
    Time,
    Compound,
    Iterate,
    Exists,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primitive => "PRIMITIVE",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Compound => "COMPOUND",
            Self::Iterate => "ITERATE",
            Self::Exists => "EXISTS",
        }
    }

    /// 取值会按日期处理的类型
    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date | Self::Time)
    }
}

impl FromStr for ConditionType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRIMITIVE" => Ok(Self::Primitive),
            "DATE" => Ok(Self::Date),
            "TIME" => Ok(Self::Time),
            "COMPOUND" => Ok(Self::Compound),
            "ITERATE" => Ok(Self::Iterate),
            "EXISTS" => Ok(Self::Exists),
            _ => Err(RuleError::UnknownType(s.to_string())),
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 条件的纯数据形式
///
/// 用于存储、传输以及从 JSON 构建 [`Condition`](crate::Condition)。
/// 类型和操作符保持为字符串，来源保持为原始 JSON，
/// 在转换为 `Condition` 时统一校验并推断。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<ConditionDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ConditionDef>>,
}

impl ConditionDef {
    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// 评估结果
///
/// 与条件树结构一一对应的追踪信息，每次评估都会新建。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConditionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<EvaluationResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_conditions: Option<Vec<EvaluationResult>>,
}

impl EvaluationResult {
    pub fn new(
        kind: ConditionType,
        operator: Operator,
        environment: Environment,
        result: bool,
    ) -> Self {
        Self {
            kind: Some(kind),
            operator: Some(operator),
            environment: Some(environment),
            left: None,
            right: None,
            result,
            results: None,
            targets: None,
            dependencies: None,
            dependency_conditions: None,
        }
    }

    /// 空条件的结果：只有 `result: true`
    pub fn pass() -> Self {
        Self {
            kind: None,
            operator: None,
            environment: None,
            left: None,
            right: None,
            result: true,
            results: None,
            targets: None,
            dependencies: None,
            dependency_conditions: None,
        }
    }

    pub fn with_left(mut self, left: Option<Value>) -> Self {
        self.left = left;
        self
    }

    pub fn with_right(mut self, right: Option<Value>) -> Self {
        self.right = right;
        self
    }

    pub fn with_results(mut self, results: Vec<EvaluationResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_targets(mut self, targets: Vec<Value>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// 转换为 JSON，便于输出或存档
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
