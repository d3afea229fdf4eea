//! 值变换管道
//!
//! 取值之后、比较之前，按顺序对值列表执行变换。标量先包装为单元素列表；
//! 普通步骤逐个元素变换，标记为整体（`all`）的步骤一次作用于整个列表。

use crate::coerce::{
    as_number, flatten, number_value, string_form, to_number, truthy,
};
use crate::context::EngineContext;
use crate::error::{Result, RuleError};
use crate::models::ConditionType;
use crate::operators::strip_delimiters;
use crate::path::{lookup, PathQuery};
use crate::temporal::{datetime_value, is_date_value, parse_datetime, parse_with_format, shift};
use num_format::{Locale, ToFormattedString};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::Arc;

/// 支持的变换类型名
pub const MUTATION_KINDS: [&str; 27] = [
    "ADD", "SUB", "MUL", "DIV", "SUM", "MIN", "MAX", "ABS", "RANGE", "AVG", "LENGTH", "REGEXP",
    "GET", "COLLECT", "SPLIT", "SLICE", "FIRST", "LAST", "FLATTEN", "NUMBER", "STRING", "DATE",
    "LOWERCASE", "UPPERCASE", "TABLE", "MEASUREMENT", "CUSTOM",
];

const DEFAULT_DATE_FORMAT: &str = "yyyy-LL-dd";
const DEFAULT_SPLIT_PATTERN: &str = r",\s*";
const MEASUREMENT_PATTERN: &str = r"^(-?\d+(?:,\d{3})*(?:\.\d+)?)\s*(\w+)?$";
const DEFAULT_FRACTION_DIGITS: usize = 3;
const MAX_FRACTION_DIGITS: usize = 20;

/// 变换步骤及其参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum MutationStep {
    Add {
        #[serde(default)]
        value: Value,
    },
    Sub {
        #[serde(default)]
        value: Value,
    },
    Mul {
        #[serde(default)]
        value: Value,
    },
    Div {
        #[serde(default)]
        value: Value,
    },
    Sum,
    Min,
    Max,
    Abs,
    Range,
    Avg,
    Length,
    Regexp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace: Option<String>,
    },
    Get {
        path: String,
    },
    Collect {
        path: String,
    },
    Split {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delimiter: Option<String>,
    },
    Slice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<i64>,
    },
    First,
    Last,
    Flatten,
    Number,
    #[serde(rename_all = "camelCase")]
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locale: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_fraction_digits: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum_fraction_digits: Option<usize>,
    },
    Date {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Lowercase,
    Uppercase,
    Table {
        #[serde(default)]
        table: Map<String, Value>,
    },
    Measurement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assume: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// 仅保留以便读取旧数据，编译时拒绝
    Custom {
        #[serde(default)]
        code: String,
    },
}

/// 一个变换步骤
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub step: MutationStep,
    /// 是否一次作用于整个值列表
    pub all: bool,
}

impl Mutation {
    pub fn new(step: MutationStep) -> Self {
        Self { step, all: false }
    }

    pub fn whole_set(step: MutationStep) -> Self {
        Self { step, all: true }
    }

    pub fn kind(&self) -> &'static str {
        match &self.step {
            MutationStep::Add { .. } => "ADD",
            MutationStep::Sub { .. } => "SUB",
            MutationStep::Mul { .. } => "MUL",
            MutationStep::Div { .. } => "DIV",
            MutationStep::Sum => "SUM",
            MutationStep::Min => "MIN",
            MutationStep::Max => "MAX",
            MutationStep::Abs => "ABS",
            MutationStep::Range => "RANGE",
            MutationStep::Avg => "AVG",
            MutationStep::Length => "LENGTH",
            MutationStep::Regexp { .. } => "REGEXP",
            MutationStep::Get { .. } => "GET",
            MutationStep::Collect { .. } => "COLLECT",
            MutationStep::Split { .. } => "SPLIT",
            MutationStep::Slice { .. } => "SLICE",
            MutationStep::First => "FIRST",
            MutationStep::Last => "LAST",
            MutationStep::Flatten => "FLATTEN",
            MutationStep::Number => "NUMBER",
            MutationStep::String { .. } => "STRING",
            MutationStep::Date { .. } => "DATE",
            MutationStep::Lowercase => "LOWERCASE",
            MutationStep::Uppercase => "UPPERCASE",
            MutationStep::Table { .. } => "TABLE",
            MutationStep::Measurement { .. } => "MEASUREMENT",
            MutationStep::Custom { .. } => "CUSTOM",
        }
    }

    /// 从 JSON 解析，接受 `kind` / `appliesToWholeSet` 作为 `type` / `all` 的别名
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(RuleError::ParseError(format!("变换定义必须是对象: {}", value)));
        };
        let mut fields = fields.clone();

        let kind = match fields.remove("type").or_else(|| fields.remove("kind")) {
            Some(Value::String(kind)) => kind.trim().to_ascii_uppercase(),
            Some(other) => return Err(RuleError::UnknownMutation(other.to_string())),
            None => return Err(RuleError::ParseError(format!("变换缺少类型: {}", value))),
        };
        if !MUTATION_KINDS.contains(&kind.as_str()) {
            return Err(RuleError::UnknownMutation(kind));
        }

        let all = fields
            .remove("all")
            .or_else(|| fields.remove("appliesToWholeSet"))
            .is_some_and(|flag| truthy(&flag));

        fields.insert("type".to_string(), Value::String(kind));
        let step = serde_json::from_value(Value::Object(fields))?;
        Ok(Self { step, all })
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(&self.step).unwrap_or(Value::Null);
        if self.all {
            if let Value::Object(fields) = &mut value {
                fields.insert("all".to_string(), Value::Bool(true));
            }
        }
        value
    }
}

impl Serialize for Mutation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Mutation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// 对单个值执行一组变换
///
/// 值缺失（或为 null）时直接返回空列表。
pub fn apply_mutations(
    value: Option<Value>,
    mutations: &[Mutation],
    kind: ConditionType,
    context: &EngineContext,
) -> Result<Vec<Value>> {
    Ok(Pipeline::compile(mutations, kind, context)?.apply(value))
}

/// 预编译的变换管道，正则和路径查询在构建时准备好
#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    steps: Vec<PreparedStep>,
    kind: ConditionType,
    locale: String,
}

#[derive(Debug, Clone)]
struct PreparedStep {
    step: MutationStep,
    all: bool,
    prepared: Prepared,
}

#[derive(Debug, Clone)]
enum Prepared {
    Nothing,
    Pattern(Regex),
    Query(Arc<PathQuery>),
}

impl Pipeline {
    pub(crate) fn compile(
        mutations: &[Mutation],
        kind: ConditionType,
        context: &EngineContext,
    ) -> Result<Self> {
        let steps = mutations
            .iter()
            .map(|mutation| {
                let prepared = prepare(&mutation.step, context)?;
                Ok(PreparedStep {
                    step: mutation.step.clone(),
                    all: mutation.all,
                    prepared,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            steps,
            kind,
            locale: context.locale().to_string(),
        })
    }

    pub(crate) fn apply(&self, value: Option<Value>) -> Vec<Value> {
        let mut values = match value {
            None | Some(Value::Null) => return Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
        };

        for step in &self.steps {
            values = if step.all {
                match self.apply_step(step, Value::Array(values)) {
                    Value::Array(items) => items,
                    other => vec![other],
                }
            } else {
                values
                    .into_iter()
                    .map(|value| self.apply_step(step, value))
                    .collect()
            };
        }
        values
    }

    fn apply_step(&self, prepared: &PreparedStep, input: Value) -> Value {
        match (&prepared.step, &prepared.prepared) {
            (MutationStep::Add { value }, _) => self.offset(input, value, 1),
            (MutationStep::Sub { value }, _) => self.offset(input, value, -1),
            (MutationStep::Mul { value }, _) => {
                let factor = to_number(value);
                broadcast(input, |x| factor.map(|y| x * y))
            }
            (MutationStep::Div { value }, _) => {
                let divisor = if truthy(value) { to_number(value) } else { Some(0.0) };
                broadcast(input, |x| match divisor {
                    Some(d) if d == 0.0 => Some(0.0),
                    Some(d) => Some(x / d),
                    None => None,
                })
            }
            (MutationStep::Sum, _) => aggregate(input, |ns| number_value(ns.iter().sum())),
            (MutationStep::Min, _) => {
                aggregate(input, |ns| number_value(ns.iter().copied().fold(f64::INFINITY, f64::min)))
            }
            (MutationStep::Max, _) => aggregate(input, |ns| {
                number_value(ns.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            }),
            (MutationStep::Range, _) => aggregate(input, |ns| {
                let min = ns.iter().copied().fold(f64::INFINITY, f64::min);
                let max = ns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Value::Array(vec![number_value(min), number_value(max)])
            }),
            (MutationStep::Avg, _) => {
                aggregate(input, |ns| number_value(ns.iter().sum::<f64>() / ns.len() as f64))
            }
            (MutationStep::Abs, _) => broadcast(input, |x| Some(x.abs())),
            (MutationStep::Length, _) => Value::from(size_of(&input)),
            (MutationStep::Regexp { replace, .. }, Prepared::Pattern(regex)) => {
                let subject = string_form(&input);
                match replace {
                    Some(replacement) => {
                        Value::String(regex.replacen(&subject, 1, replacement.as_str()).into_owned())
                    }
                    None => regex
                        .find(&subject)
                        .map(|m| Value::String(m.as_str().to_string()))
                        .unwrap_or(Value::Null),
                }
            }
            (MutationStep::Get { path }, _) => lookup(&input, path).cloned().unwrap_or(Value::Null),
            (MutationStep::Collect { .. }, Prepared::Query(query)) => {
                Value::Array(query.execute(&input))
            }
            (MutationStep::Split { .. }, Prepared::Pattern(delimiter)) => Value::Array(
                delimiter
                    .split(&string_form(&input))
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
            (MutationStep::Slice { start, end }, _) => slice(input, *start, *end),
            (MutationStep::First, _) => match input {
                Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
                other => other,
            },
            (MutationStep::Last, _) => match input {
                Value::Array(items) => items.into_iter().last().unwrap_or(Value::Null),
                other => other,
            },
            (MutationStep::Flatten, _) => match input {
                Value::Array(_) => Value::Array(flatten(&input)),
                other => Value::Array(vec![other]),
            },
            (MutationStep::Number, _) => parse_number(&input),
            (
                MutationStep::String {
                    locale,
                    minimum_fraction_digits,
                    maximum_fraction_digits,
                },
                _,
            ) => match &input {
                Value::String(_) => input,
                Value::Number(n) => {
                    let locale = locale.as_deref().unwrap_or(&self.locale);
                    let min = minimum_fraction_digits.unwrap_or(0);
                    let max = maximum_fraction_digits.unwrap_or(DEFAULT_FRACTION_DIGITS.max(min));
                    n.as_f64()
                        .map(|n| Value::String(format_number(n, locale, min, max)))
                        .unwrap_or(Value::Null)
                }
                other => Value::String(string_form(other)),
            },
            (MutationStep::Date { format }, _) => {
                let format = format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT);
                parse_with_format(string_form(&input).trim(), format)
                    .map(|dt| datetime_value(&dt))
                    .unwrap_or(Value::Null)
            }
            (MutationStep::Lowercase, _) => match input {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            },
            (MutationStep::Uppercase, _) => match input {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            },
            (MutationStep::Table { table }, _) => table
                .get(&string_form(&input))
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null),
            (MutationStep::Measurement { assume, target }, Prepared::Pattern(pattern)) => measure(
                pattern,
                &input,
                assume.as_deref().unwrap_or("sqft"),
                target.as_deref().unwrap_or("m"),
            ),
            // 构建阶段已拒绝或已准备好的组合之外不会出现
            _ => Value::Null,
        }
    }

    /// ADD / SUB：日期上下文中平移时间，否则做数值加减
    fn offset(&self, input: Value, delta: &Value, sign: i64) -> Value {
        if self.kind.is_temporal() || is_date_value(&input) {
            let delta = match delta {
                Value::Object(_) | Value::Number(_) => Some(delta.clone()),
                other => as_number(other).map(number_value),
            };
            return parse_datetime(&input)
                .zip(delta)
                .and_then(|(dt, delta)| shift(dt, &delta, sign))
                .map(|dt| datetime_value(&dt))
                .unwrap_or(Value::Null);
        }
        match (as_number(&input), as_number(delta)) {
            (Some(x), Some(d)) => number_value(x + d * sign as f64),
            _ => input,
        }
    }
}

fn prepare(step: &MutationStep, context: &EngineContext) -> Result<Prepared> {
    let prepared = match step {
        MutationStep::Custom { .. } => {
            return Err(RuleError::structural("CUSTOM", "不支持执行自定义代码的变换"));
        }
        MutationStep::Regexp { pattern, .. } => {
            let pattern = pattern
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| RuleError::ParseError("REGEXP 变换缺少匹配模式".to_string()))?;
            Prepared::Pattern(compile_pattern(strip_delimiters(pattern))?)
        }
        MutationStep::Split { delimiter } => match delimiter {
            Some(delimiter) => Prepared::Pattern(compile_pattern(&regex::escape(delimiter))?),
            None => Prepared::Pattern(compile_pattern(DEFAULT_SPLIT_PATTERN)?),
        },
        MutationStep::Measurement { .. } => Prepared::Pattern(compile_pattern(MEASUREMENT_PATTERN)?),
        MutationStep::Collect { path } => Prepared::Query(context.paths().get_or_compile(path)?),
        _ => Prepared::Nothing,
    };
    Ok(prepared)
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| RuleError::invalid_pattern(pattern, e))
}

/// 数值运算作用于标量或数组中的每个元素，无法计算时为 null
fn broadcast(input: Value, op: impl Fn(f64) -> Option<f64>) -> Value {
    let apply = |value: &Value| {
        to_number(value)
            .and_then(&op)
            .map(number_value)
            .unwrap_or(Value::Null)
    };
    match &input {
        Value::Array(items) => Value::Array(items.iter().map(apply).collect()),
        other => apply(other),
    }
}

/// 聚合：非数组或空数组原样返回，单元素取其数值，多元素展开后逐个转为数字
fn aggregate(input: Value, reduce: impl Fn(&[f64]) -> Value) -> Value {
    let items = match input {
        Value::Array(items) if !items.is_empty() => items,
        other => return other,
    };
    if let [single] = items.as_slice() {
        return to_number(single).map(number_value).unwrap_or(Value::Null);
    }

    let numbers: Option<Vec<f64>> = flatten(&Value::Array(items)).iter().map(to_number).collect();
    match numbers {
        Some(numbers) if !numbers.is_empty() => reduce(&numbers),
        _ => Value::Null,
    }
}

fn size_of(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}

/// 负数下标从末尾计数，越界时截断
fn slice_bounds(len: usize, start: Option<i64>, end: Option<i64>) -> (usize, usize) {
    let resolve = |index: i64| {
        if index < 0 {
            len.saturating_sub(index.unsigned_abs() as usize)
        } else {
            (index as usize).min(len)
        }
    };
    let from = start.map(resolve).unwrap_or(0);
    let to = end.map(resolve).unwrap_or(len);
    (from, to.max(from))
}

fn slice(input: Value, start: Option<i64>, end: Option<i64>) -> Value {
    match input {
        Value::Array(items) => {
            let (from, to) = slice_bounds(items.len(), start, end);
            Value::Array(items[from..to].to_vec())
        }
        other => {
            let chars: Vec<char> = string_form(&other).chars().collect();
            let (from, to) = slice_bounds(chars.len(), start, end);
            Value::String(chars[from..to].iter().collect())
        }
    }
}

/// null 为 0，数字字符串直接解析，其余去掉非数字字符后按前缀解析
fn parse_number(input: &Value) -> Value {
    if input.is_null() {
        return Value::from(0);
    }
    if let Some(n) = as_number(input) {
        return number_value(n);
    }
    let stripped: String = string_form(input)
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    parse_float_prefix(&stripped)
        .map(number_value)
        .unwrap_or(Value::Null)
}

fn parse_float_prefix(text: &str) -> Option<f64> {
    let mut seen_dot = false;
    let end = text
        .char_indices()
        .find(|(_, c)| {
            if *c == '.' && !seen_dot {
                seen_dot = true;
                false
            } else {
                !c.is_ascii_digit()
            }
        })
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse::<f64>().ok()
}

fn resolve_locale(name: &str) -> Locale {
    let name = name.replace('_', "-");
    let language = name.split('-').next().unwrap_or_default().to_string();
    Locale::from_name(&name)
        .or_else(|_| Locale::from_name(&language))
        .unwrap_or(Locale::en)
}

/// 按区域设置格式化数字：千位分隔、小数点符号和小数位数
fn format_number(n: f64, locale: &str, min_digits: usize, max_digits: usize) -> String {
    let locale = resolve_locale(locale);
    let min_digits = min_digits.min(MAX_FRACTION_DIGITS);
    let max_digits = max_digits.clamp(min_digits, MAX_FRACTION_DIGITS);

    let fixed = format!("{:.*}", max_digits, n.abs());
    let (integer, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let mut fraction = fraction.to_string();
    while fraction.len() > min_digits && fraction.ends_with('0') {
        fraction.pop();
    }

    let integer = integer
        .parse::<u64>()
        .map(|i| i.to_formatted_string(&locale))
        .unwrap_or_else(|_| integer.to_string());

    let is_zero = integer.chars().all(|c| !c.is_ascii_digit() || c == '0')
        && fraction.chars().all(|c| c == '0');
    let mut out = String::new();
    if n < 0.0 && !is_zero {
        out.push_str(locale.minus_sign());
    }
    out.push_str(&integer);
    if !fraction.is_empty() {
        out.push_str(locale.decimal());
        out.push_str(&fraction);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Length,
    Area,
}

/// 单位换算系数（长度以米为基准，面积以平方米为基准）
fn unit(name: &str) -> Option<(Dimension, f64)> {
    use Dimension::{Area, Length};
    let unit = match name {
        "mm" => (Length, 0.001),
        "cm" => (Length, 0.01),
        "m" => (Length, 1.0),
        "km" => (Length, 1000.0),
        "in" => (Length, 0.0254),
        "ft" => (Length, 0.3048),
        "yd" => (Length, 0.9144),
        "mi" => (Length, 1609.344),
        "sqmm" => (Area, 1e-6),
        "sqcm" => (Area, 1e-4),
        "sqm" | "m2" => (Area, 1.0),
        "sqkm" => (Area, 1e6),
        "sqin" => (Area, 0.000_645_16),
        "sqft" => (Area, 0.092_903_04),
        "sqyd" => (Area, 0.836_127_36),
        "acre" => (Area, 4_046.856_422_4),
        "ha" => (Area, 10_000.0),
        "sqmi" => (Area, 2_589_988.110_336),
        _ => return None,
    };
    Some(unit)
}

fn convert(magnitude: f64, from: &str, to: &str) -> Option<f64> {
    let (from_dim, from_factor) = unit(from)?;
    let (to_dim, to_factor) = unit(to)?;
    match (from_dim, to_dim) {
        (a, b) if a == b => Some(magnitude * from_factor / to_factor),
        // 面积换算到长度单位时，目标取该单位的平方
        (Dimension::Area, Dimension::Length) => Some(magnitude * from_factor / (to_factor * to_factor)),
        _ => None,
    }
}

fn measure(pattern: &Regex, input: &Value, assume: &str, target: &str) -> Value {
    let text = string_form(input).trim().to_uppercase();
    let Some(captures) = pattern.captures(&text) else {
        return Value::Null;
    };
    let Ok(magnitude) = captures[1].replace(',', "").parse::<f64>() else {
        return Value::Null;
    };
    let from = captures
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_else(|| assume.to_lowercase());

    convert(magnitude, &from, &target.to_lowercase())
        .map(number_value)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(value: Value) -> Mutation {
        Mutation::from_value(&value).unwrap()
    }

    fn run(input: Value, steps: Value) -> Vec<Value> {
        run_as(ConditionType::Primitive, input, steps)
    }

    fn run_as(kind: ConditionType, input: Value, steps: Value) -> Vec<Value> {
        let steps: Vec<Mutation> = serde_json::from_value(steps).unwrap();
        apply_mutations(Some(input), &steps, kind, &EngineContext::default()).unwrap()
    }

    #[test]
    fn test_parse_aliases() {
        let m = mutation(json!({ "kind": "sum", "appliesToWholeSet": true }));
        assert_eq!(m.step, MutationStep::Sum);
        assert!(m.all);
        assert_eq!(m.to_value(), json!({ "type": "SUM", "all": true }));

        let m = mutation(json!({ "type": "ADD", "value": 5 }));
        assert_eq!(m.to_value(), json!({ "type": "ADD", "value": 5 }));
    }

    #[test]
    fn test_unknown_mutation() {
        let err = Mutation::from_value(&json!({ "type": "EXPLODE" })).unwrap_err();
        assert!(matches!(err, RuleError::UnknownMutation(ref k) if k == "EXPLODE"));
        assert!(err.is_structural());
    }

    #[test]
    fn test_absent_input_short_circuits() {
        let steps = vec![mutation(json!({ "type": "NUMBER" }))];
        let ctx = EngineContext::default();
        assert!(apply_mutations(None, &steps, ConditionType::Primitive, &ctx).unwrap().is_empty());
        assert!(
            apply_mutations(Some(Value::Null), &steps, ConditionType::Primitive, &ctx)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run(json!(2), json!([{ "type": "ADD", "value": 3 }])), vec![json!(5)]);
        assert_eq!(run(json!("10"), json!([{ "type": "SUB", "value": 4 }])), vec![json!(6)]);
        assert_eq!(run(json!("abc"), json!([{ "type": "ADD", "value": 1 }])), vec![json!("abc")]);
        assert_eq!(run(json!([1, 2]), json!([{ "type": "MUL", "value": 3 }])), vec![json!(3), json!(6)]);
        assert_eq!(
            run(json!([[1, 2]]), json!([{ "type": "MUL", "value": 2 }])),
            vec![json!([2, 4])]
        );
        assert_eq!(run(json!(9), json!([{ "type": "DIV", "value": 0 }])), vec![json!(0)]);
        assert_eq!(run(json!(9), json!([{ "type": "DIV", "value": 2 }])), vec![json!(4.5)]);
        assert_eq!(run(json!(-3), json!([{ "type": "ABS" }])), vec![json!(3)]);
    }

    #[test]
    fn test_date_arithmetic() {
        assert_eq!(
            run(json!("2024-01-31T00:00:00Z"), json!([{ "type": "ADD", "value": { "days": 1 } }])),
            vec![json!("2024-02-01T00:00:00Z")]
        );
        assert_eq!(
            run_as(
                ConditionType::Date,
                json!("2024-03-01"),
                json!([{ "type": "SUB", "value": 3600 }])
            ),
            vec![json!("2024-02-29T23:00:00Z")]
        );
        assert_eq!(
            run_as(ConditionType::Date, json!("soon"), json!([{ "type": "ADD", "value": 1 }])),
            vec![json!(null)]
        );
    }

    #[test]
    fn test_aggregates() {
        let sum = json!([{ "type": "SUM", "all": true }]);
        assert_eq!(run(json!([1, 2, 3, 4]), sum.clone()), vec![json!(10)]);
        assert_eq!(run(json!(["1", "2"]), sum.clone()), vec![json!(3)]);
        assert_eq!(run(json!(["7"]), sum), vec![json!(7)]);

        assert_eq!(run(json!([3, [1, 9]]), json!([{ "type": "MIN", "all": true }])), vec![json!(1)]);
        assert_eq!(run(json!([3, [1, 9]]), json!([{ "type": "MAX", "all": true }])), vec![json!(9)]);
        assert_eq!(
            run(json!([4, 1, 3]), json!([{ "type": "RANGE", "all": true }])),
            vec![json!(1), json!(4)]
        );
        assert_eq!(run(json!([1, 2]), json!([{ "type": "AVG", "all": true }])), vec![json!(1.5)]);
        assert_eq!(run(json!([1, "x"]), json!([{ "type": "SUM", "all": true }])), vec![json!(null)]);
        // 非整体模式下对单个元素聚合，原样返回
        assert_eq!(run(json!([1, 2]), json!([{ "type": "SUM" }])), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_length_and_slicing() {
        assert_eq!(run(json!("héllo"), json!([{ "type": "LENGTH" }])), vec![json!(5)]);
        assert_eq!(run(json!([1, 2, 3]), json!([{ "type": "LENGTH", "all": true }])), vec![json!(3)]);
        assert_eq!(run(json!("abcdef"), json!([{ "type": "SLICE", "start": 1, "end": -1 }])), vec![json!("bcde")]);
        assert_eq!(
            run(json!([1, 2, 3, 4]), json!([{ "type": "SLICE", "start": -2, "all": true }])),
            vec![json!(3), json!(4)]
        );
        assert_eq!(run(json!(12345), json!([{ "type": "SLICE", "end": 2 }])), vec![json!("12")]);
    }

    #[test]
    fn test_regexp() {
        assert_eq!(
            run(json!("order-1234-x"), json!([{ "type": "REGEXP", "pattern": "\\d+" }])),
            vec![json!("1234")]
        );
        assert_eq!(
            run(json!("a-b-c"), json!([{ "type": "REGEXP", "pattern": "/-/", "replace": "+" }])),
            vec![json!("a+b-c")]
        );
        assert_eq!(run(json!("abc"), json!([{ "type": "REGEXP", "pattern": "\\d" }])), vec![json!(null)]);

        let steps = vec![mutation(json!({ "type": "REGEXP" }))];
        let err = apply_mutations(Some(json!("x")), &steps, ConditionType::Primitive, &EngineContext::default())
            .unwrap_err();
        assert!(matches!(err, RuleError::ParseError(_)));

        let steps = vec![mutation(json!({ "type": "REGEXP", "pattern": "(" }))];
        let err = apply_mutations(Some(json!("x")), &steps, ConditionType::Primitive, &EngineContext::default())
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
    }

    #[test]
    fn test_get_collect_split() {
        let record = json!({ "user": { "tags": [{ "id": 1 }, { "id": 2 }] } });
        assert_eq!(
            run(record.clone(), json!([{ "type": "GET", "path": "user.tags[1].id" }])),
            vec![json!(2)]
        );
        assert_eq!(
            run(record, json!([{ "type": "COLLECT", "path": "user.tags[*].id" }])),
            vec![json!([1, 2])]
        );
        assert_eq!(
            run(json!("a, b,c"), json!([{ "type": "SPLIT" }])),
            vec![json!(["a", "b", "c"])]
        );
        assert_eq!(
            run(json!("a|b"), json!([{ "type": "SPLIT", "delimiter": "|" }, { "type": "FLATTEN", "all": true }])),
            vec![json!("a"), json!("b")]
        );
    }

    #[test]
    fn test_first_last_flatten() {
        assert_eq!(run(json!([[1, 2, 3]]), json!([{ "type": "FIRST" }])), vec![json!(1)]);
        assert_eq!(run(json!([[1, 2, 3]]), json!([{ "type": "LAST" }])), vec![json!(3)]);
        assert_eq!(run(json!("x"), json!([{ "type": "FIRST" }])), vec![json!("x")]);
        assert_eq!(run(json!(5), json!([{ "type": "FLATTEN" }])), vec![json!([5])]);
        assert_eq!(
            run(json!([1, [2, [3]]]), json!([{ "type": "FLATTEN", "all": true }])),
            vec![json!(1), json!(2), json!(3)]
        );
    }

    #[test]
    fn test_number() {
        let number = json!([{ "type": "NUMBER" }]);
        assert_eq!(run(json!("1000"), number.clone()), vec![json!(1000)]);
        assert_eq!(run(json!("$2000"), number.clone()), vec![json!(2000)]);
        assert_eq!(run(json!("1.5kg"), number.clone()), vec![json!(1.5)]);
        assert_eq!(run(json!(""), number.clone()), vec![json!(null)]);
        assert_eq!(run(json!([null]), number.clone()), vec![json!(0)]);
        assert_eq!(run(json!("abc"), number), vec![json!(null)]);
    }

    #[test]
    fn test_string_formatting() {
        assert_eq!(
            run(json!(1234567.891), json!([{ "type": "STRING" }])),
            vec![json!("1,234,567.891")]
        );
        assert_eq!(run(json!(-1234.5), json!([{ "type": "STRING" }])), vec![json!("-1,234.5")]);
        assert_eq!(run(json!(2), json!([{ "type": "STRING" }])), vec![json!("2")]);
        assert_eq!(
            run(json!(3.14159), json!([{ "type": "STRING", "maximumFractionDigits": 2 }])),
            vec![json!("3.14")]
        );
        assert_eq!(
            run(json!(1234.5), json!([{ "type": "STRING", "locale": "de-DE" }])),
            vec![json!("1.234,5")]
        );
        assert_eq!(run(json!("already"), json!([{ "type": "STRING" }])), vec![json!("already")]);
        assert_eq!(run(json!(true), json!([{ "type": "STRING" }])), vec![json!("true")]);
    }

    #[test]
    fn test_fraction_digits_above_limit() {
        assert_eq!(
            run(json!(1.5), json!([{ "type": "STRING", "minimumFractionDigits": 25 }])),
            vec![json!("1.50000000000000000000")]
        );
        assert_eq!(
            run(
                json!(2),
                json!([{ "type": "STRING", "minimumFractionDigits": 30, "maximumFractionDigits": 2 }])
            ),
            vec![json!("2.00000000000000000000")]
        );
    }

    #[test]
    fn test_date_shift_overflow_yields_null() {
        let date = json!("2024-01-31T00:00:00Z");
        assert_eq!(
            run_as(ConditionType::Date, date.clone(), json!([{ "type": "ADD", "value": { "days": 1e15 } }])),
            vec![json!(null)]
        );
        assert_eq!(
            run_as(ConditionType::Date, date.clone(), json!([{ "type": "SUB", "value": -1e300 }])),
            vec![json!(null)]
        );
        assert_eq!(
            run_as(ConditionType::Date, date.clone(), json!([{ "type": "ADD", "value": 1e300 }])),
            vec![json!(null)]
        );
        assert_eq!(
            run_as(ConditionType::Date, date, json!([{ "type": "ADD", "value": { "years": 1e10 } }])),
            vec![json!(null)]
        );
    }

    #[test]
    fn test_date_parsing() {
        assert_eq!(run(json!("2024-03-01"), json!([{ "type": "DATE" }])), vec![json!("2024-03-01T00:00:00Z")]);
        assert_eq!(
            run(json!("01/03/2024"), json!([{ "type": "DATE", "format": "dd/MM/yyyy" }])),
            vec![json!("2024-03-01T00:00:00Z")]
        );
        assert_eq!(run(json!("garbage"), json!([{ "type": "DATE" }])), vec![json!(null)]);
    }

    #[test]
    fn test_case_and_table() {
        assert_eq!(run(json!("MiXeD"), json!([{ "type": "LOWERCASE" }])), vec![json!("mixed")]);
        assert_eq!(run(json!("MiXeD"), json!([{ "type": "UPPERCASE" }])), vec![json!("MIXED")]);
        assert_eq!(run(json!(1), json!([{ "type": "UPPERCASE" }])), vec![json!(1)]);

        let table = json!([{ "type": "TABLE", "table": { "1": "gold", "2": null } }]);
        assert_eq!(run(json!(1), table.clone()), vec![json!("gold")]);
        assert_eq!(run(json!("2"), table.clone()), vec![json!(null)]);
        assert_eq!(run(json!("3"), table), vec![json!(null)]);
    }

    #[test]
    fn test_measurement() {
        let result = run(json!("1,000 sqft"), json!([{ "type": "MEASUREMENT" }]));
        let value = result[0].as_f64().unwrap();
        assert!((value - 92.90304).abs() < 1e-9);

        let result = run(json!("12"), json!([{ "type": "MEASUREMENT", "assume": "in", "target": "ft" }]));
        assert!((result[0].as_f64().unwrap() - 1.0).abs() < 1e-9);

        let result = run(json!("2 ha"), json!([{ "type": "MEASUREMENT", "target": "sqm" }]));
        assert_eq!(result, vec![json!(20000)]);

        assert_eq!(
            run(json!("3 ft"), json!([{ "type": "MEASUREMENT", "target": "acre" }])),
            vec![json!(null)]
        );
        assert_eq!(run(json!("big"), json!([{ "type": "MEASUREMENT" }])), vec![json!(null)]);
    }

    #[test]
    fn test_custom_is_rejected() {
        let steps = vec![mutation(json!({ "type": "CUSTOM", "code": "return input" }))];
        let err = apply_mutations(Some(json!(1)), &steps, ConditionType::Primitive, &EngineContext::default())
            .unwrap_err();
        assert!(err.is_structural());
    }
}
