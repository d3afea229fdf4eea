//! 取值来源
//!
//! 来源描述"值从哪里来"：字面量、字段路径、相对日期、环境变量或区间。
//! 纯数据形式中的变体靠字段推断，这里在反序列化时一次性转换为带类型的枚举。

use crate::coerce::{arrayify, flatten, number_value, to_number, truthy};
use crate::context::EngineContext;
use crate::error::{Result, RuleError};
use crate::models::{ConditionType, Environment};
use crate::mutations::{Mutation, Pipeline};
use crate::temporal::{datetime_value, RelativeDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

/// 来源变体
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// 记录本身
    Passthrough,
    Value(Value),
    /// 路径查询，`all` 为真时返回全部匹配
    Path { path: String, all: bool },
    Date(RelativeDate),
    Env(String),
    /// 由单个来源的全部值得出 `[min, max]`
    Range(Box<Source>),
    /// 显式给出左右边界
    Between {
        left: Option<Box<Source>>,
        right: Option<Box<Source>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub kind: SourceKind,
    pub mutate: Vec<Mutation>,
}

impl Source {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            mutate: Vec::new(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::new(SourceKind::Value(value.into()))
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::new(SourceKind::Path {
            path: path.into(),
            all: false,
        })
    }

    pub fn path_all(path: impl Into<String>) -> Self {
        Self::new(SourceKind::Path {
            path: path.into(),
            all: true,
        })
    }

    pub fn env(name: impl Into<String>) -> Self {
        Self::new(SourceKind::Env(name.into()))
    }

    pub fn date(date: RelativeDate) -> Self {
        Self::new(SourceKind::Date(date))
    }

    pub fn passthrough() -> Self {
        Self::new(SourceKind::Passthrough)
    }

    pub fn range(source: Source) -> Self {
        Self::new(SourceKind::Range(Box::new(source)))
    }

    pub fn between(left: Option<Source>, right: Option<Source>) -> Self {
        Self::new(SourceKind::Between {
            left: left.map(Box::new),
            right: right.map(Box::new),
        })
    }

    pub fn with_mutation(mut self, mutation: Mutation) -> Self {
        self.mutate.push(mutation);
        self
    }

    /// 区间来源总是产出两个边界
    pub fn is_extent(&self) -> bool {
        matches!(self.kind, SourceKind::Range(_) | SourceKind::Between { .. })
    }

    /// 从纯数据形式解析
    ///
    /// 非对象值视为字面量。对象优先看 `type` 标签，没有标签时按字段推断，
    /// 优先级从高到低为 between、env、date、path/get/collect、value，
    /// 都不匹配时为直通（返回记录本身）。
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Ok(Self::value(value.clone()));
        };

        let kind = match fields.get("type").and_then(Value::as_str) {
            Some(tag) => match Self::tagged(tag, fields)? {
                Some(kind) => kind,
                None => Self::infer(fields)?,
            },
            None => Self::infer(fields)?,
        };

        Ok(Self {
            kind,
            mutate: parse_mutations(fields.get("mutate"))?,
        })
    }

    fn tagged(tag: &str, fields: &Map<String, Value>) -> Result<Option<SourceKind>> {
        let kind = match tag.to_ascii_uppercase().as_str() {
            "VALUE" => SourceKind::Value(fields.get("value").cloned().unwrap_or(Value::Null)),
            "PATH" => match fields.get("path").and_then(Value::as_str) {
                Some(path) => SourceKind::Path {
                    path: path.to_string(),
                    all: fields.get("all").is_some_and(truthy),
                },
                None => return Err(source_error(fields, "PATH 来源缺少 path")),
            },
            "DATE" => match fields.get("date").and_then(Value::as_str).and_then(RelativeDate::parse) {
                Some(date) => SourceKind::Date(date),
                None => return Err(source_error(fields, "DATE 来源需要 today、yesterday 或 tomorrow")),
            },
            "ENV" => match fields.get("env").and_then(Value::as_str) {
                Some(name) => SourceKind::Env(name.to_string()),
                None => return Err(source_error(fields, "ENV 来源缺少变量名")),
            },
            "RANGE" => {
                let range = fields
                    .get("range")
                    .or_else(|| fields.get("between").and_then(|b| b.get("range")))
                    .ok_or_else(|| source_error(fields, "RANGE 来源缺少 range"))?;
                SourceKind::Range(Box::new(Self::from_value(range)?))
            }
            "BETWEEN" => match fields.get("between") {
                Some(between) => Self::extent(between)?,
                None => Self::extent(&Value::Object(fields.clone()))?,
            },
            "PASSTHRU" | "PASSTHROUGH" => SourceKind::Passthrough,
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn infer(fields: &Map<String, Value>) -> Result<SourceKind> {
        if let Some(between) = fields.get("between").filter(|b| b.is_object()) {
            return Self::extent(between);
        }
        if let Some(name) = fields.get("env").and_then(Value::as_str) {
            return Ok(SourceKind::Env(name.to_string()));
        }
        if let Some(date) = fields.get("date").and_then(Value::as_str).and_then(RelativeDate::parse) {
            return Ok(SourceKind::Date(date));
        }
        if let Some(path) = fields.get("path").and_then(Value::as_str) {
            return Ok(SourceKind::Path {
                path: path.to_string(),
                all: fields.get("all").is_some_and(truthy),
            });
        }
        if let Some(path) = fields.get("get").and_then(Value::as_str) {
            return Ok(SourceKind::Path {
                path: path.to_string(),
                all: false,
            });
        }
        if let Some(path) = fields.get("collect").and_then(Value::as_str) {
            return Ok(SourceKind::Path {
                path: path.to_string(),
                all: true,
            });
        }
        if let Some(value) = fields.get("value") {
            return Ok(SourceKind::Value(value.clone()));
        }
        Ok(SourceKind::Passthrough)
    }

    fn extent(between: &Value) -> Result<SourceKind> {
        if let Some(range) = between.get("range").filter(|r| !r.is_null()) {
            return Ok(SourceKind::Range(Box::new(Self::from_value(range)?)));
        }
        let side = |key: &str| -> Result<Option<Box<Source>>> {
            match between.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(spec) => Ok(Some(Box::new(Self::from_value(spec)?))),
            }
        };
        Ok(SourceKind::Between {
            left: side("left")?,
            right: side("right")?,
        })
    }

    /// 规范的纯数据形式，不带 `type` 标签
    pub fn to_value(&self) -> Value {
        let mut fields = Map::new();
        match &self.kind {
            SourceKind::Passthrough => {}
            SourceKind::Value(value) => {
                fields.insert("value".to_string(), value.clone());
            }
            SourceKind::Path { path, all } => {
                fields.insert("path".to_string(), Value::String(path.clone()));
                if *all {
                    fields.insert("all".to_string(), Value::Bool(true));
                }
            }
            SourceKind::Date(date) => {
                fields.insert("date".to_string(), Value::String(date.as_str().to_string()));
            }
            SourceKind::Env(name) => {
                fields.insert("env".to_string(), Value::String(name.clone()));
            }
            SourceKind::Range(range) => {
                let mut between = Map::new();
                between.insert("range".to_string(), range.to_value());
                fields.insert("between".to_string(), Value::Object(between));
            }
            SourceKind::Between { left, right } => {
                let mut between = Map::new();
                if let Some(left) = left {
                    between.insert("left".to_string(), left.to_value());
                }
                if let Some(right) = right {
                    between.insert("right".to_string(), right.to_value());
                }
                fields.insert("between".to_string(), Value::Object(between));
            }
        }
        if !self.mutate.is_empty() {
            fields.insert(
                "mutate".to_string(),
                Value::Array(self.mutate.iter().map(Mutation::to_value).collect()),
            );
        }
        Value::Object(fields)
    }
}

fn parse_mutations(value: Option<&Value>) -> Result<Vec<Mutation>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(steps)) => steps.iter().map(Mutation::from_value).collect(),
        Some(step) => Ok(vec![Mutation::from_value(step)?]),
    }
}

fn source_error(fields: &Map<String, Value>, message: &str) -> RuleError {
    RuleError::structural(Value::Object(fields.clone()).to_string(), message)
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl From<Value> for Source {
    fn from(value: Value) -> Self {
        Self::value(value)
    }
}

/// 编译后的取值函数
pub(crate) type Sourcer = Arc<dyn Fn(&Value, &Environment) -> Option<Value> + Send + Sync>;

/// 编译来源
///
/// 路径查询和变换在这里准备好。非结构性的错误（如变换中的非法正则）
/// 附带来源的规范形式后以 [`RuleError::SourceResolution`] 返回。
pub(crate) fn compile_source(
    source: Option<&Source>,
    kind: ConditionType,
    context: &Arc<EngineContext>,
) -> Result<Sourcer> {
    let Some(source) = source else {
        return Ok(Arc::new(|_: &Value, _: &Environment| -> Option<Value> { None }));
    };

    build_sourcer(source, kind, context).map_err(|err| match err {
        err if err.is_structural() => err,
        err @ RuleError::SourceResolution { .. } => err,
        err => RuleError::SourceResolution {
            source_spec: source.to_value().to_string(),
            message: err.to_string(),
        },
    })
}

fn build_sourcer(
    source: &Source,
    kind: ConditionType,
    context: &Arc<EngineContext>,
) -> Result<Sourcer> {
    let fetch: Sourcer = match &source.kind {
        SourceKind::Passthrough => Arc::new(|record: &Value, _: &Environment| Some(record.clone())),
        SourceKind::Value(value) => {
            let value = value.clone();
            Arc::new(move |_: &Value, _: &Environment| Some(value.clone()))
        }
        SourceKind::Path { path, all } => {
            let query = context.paths().get_or_compile(path)?;
            if *all {
                Arc::new(move |record: &Value, _: &Environment| {
                    Some(Value::Array(query.execute(record)))
                })
            } else {
                Arc::new(move |record: &Value, _: &Environment| query.first(record))
            }
        }
        SourceKind::Date(date) => {
            let date = *date;
            Arc::new(move |_: &Value, _: &Environment| Some(datetime_value(&date.resolve())))
        }
        SourceKind::Env(name) => {
            let name = name.clone();
            Arc::new(move |_: &Value, env: &Environment| env.get(&name).cloned())
        }
        SourceKind::Range(range) => {
            let inner = compile_source(Some(range), kind, context)?;
            Arc::new(move |record: &Value, env: &Environment| {
                Some(min_max(inner(record, env)))
            })
        }
        SourceKind::Between { left, right } => {
            let left = compile_source(left.as_deref(), kind, context)?;
            let right = compile_source(right.as_deref(), kind, context)?;
            Arc::new(move |record: &Value, env: &Environment| {
                Some(Value::Array(vec![
                    left(record, env).unwrap_or(Value::Null),
                    right(record, env).unwrap_or(Value::Null),
                ]))
            })
        }
    };

    if source.mutate.is_empty() {
        return Ok(fetch);
    }

    let pipeline = Pipeline::compile(&source.mutate, kind, context)?;
    let whole = source.is_extent() || matches!(source.kind, SourceKind::Path { all: true, .. });
    Ok(Arc::new(move |record: &Value, env: &Environment| {
        let values = pipeline.apply(fetch(record, env));
        if whole {
            Some(Value::Array(values))
        } else {
            values.into_iter().next()
        }
    }))
}

/// 展开后转为数字取最小、最大值；值缺失或含非数字时两端都为 null
fn min_max(values: Option<Value>) -> Value {
    let numbers: Option<Vec<f64>> = values
        .filter(|v| !v.is_null())
        .map(|v| flatten(&Value::Array(arrayify(&v))))
        .and_then(|items| items.iter().map(to_number).collect());

    match numbers {
        Some(numbers) if !numbers.is_empty() => {
            let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Value::Array(vec![number_value(min), number_value(max)])
        }
        _ => Value::Array(vec![Value::Null, Value::Null]),
    }
}
