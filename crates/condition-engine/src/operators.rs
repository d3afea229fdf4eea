//! 条件操作符定义
//!
//! 比较操作符作用于两个已取出的值，逻辑操作符作用于一组子条件的布尔结果。

use crate::coerce::{arrayify, as_number, compare_order, loose_eq, string_form, strict_eq, truthy};
use crate::error::{Result, RuleError};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    // 比较
    #[serde(alias = "EQUALS")]
    Equal,
    #[serde(alias = "NOT_EQUALS")]
    NotEqual,
    Like,
    NotLike,
    Lt,
    Gt,

    // 包含检查
    Includes,
    NotIncludes,

    // 真值
    True,
    False,

    // 逻辑组合
    All,
    NotAll,
    Any,
    #[serde(rename = "NONE")]
    NoneOf,

    // 区间
    Between,
    NotBetween,

    Matches,
}

impl Operator {
    pub const ALL_OPERATORS: [Operator; 17] = [
        Self::Equal,
        Self::NotEqual,
        Self::Like,
        Self::NotLike,
        Self::Lt,
        Self::Gt,
        Self::Includes,
        Self::NotIncludes,
        Self::True,
        Self::False,
        Self::All,
        Self::NotAll,
        Self::Any,
        Self::NoneOf,
        Self::Between,
        Self::NotBetween,
        Self::Matches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "EQUAL",
            Self::NotEqual => "NOT_EQUAL",
            Self::Like => "LIKE",
            Self::NotLike => "NOT_LIKE",
            Self::Lt => "LT",
            Self::Gt => "GT",
            Self::Includes => "INCLUDES",
            Self::NotIncludes => "NOT_INCLUDES",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::All => "ALL",
            Self::NotAll => "NOT_ALL",
            Self::Any => "ANY",
            Self::NoneOf => "NONE",
            Self::Between => "BETWEEN",
            Self::NotBetween => "NOT_BETWEEN",
            Self::Matches => "MATCHES",
        }
    }

    /// 作用于一组布尔结果的操作符
    pub fn is_logical(&self) -> bool {
        matches!(self, Self::All | Self::NotAll | Self::Any | Self::NoneOf)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::Like
                | Self::NotLike
                | Self::Lt
                | Self::Gt
                | Self::Includes
                | Self::NotIncludes
                | Self::Matches
        )
    }

    pub fn is_extent(&self) -> bool {
        matches!(self, Self::Between | Self::NotBetween)
    }

    /// 是否需要右侧取值
    pub fn requires_right(&self) -> bool {
        self.is_comparison() || self.is_extent()
    }

    /// 对两个已取出的值执行比较
    pub fn compare(self, left: &Value, right: &Value) -> Result<bool> {
        let matched = match self {
            Self::Equal => strict_eq(left, right),
            Self::NotEqual => !strict_eq(left, right),
            Self::Like => loose_eq(left, right),
            Self::NotLike => !loose_eq(left, right),
            Self::Lt => compare_order(left, right) == Some(Ordering::Less),
            Self::Gt => compare_order(left, right) == Some(Ordering::Greater),
            Self::Includes => Self::includes(left, right),
            Self::NotIncludes => !Self::includes(left, right),
            Self::True => truthy(left),
            Self::False => !truthy(left),
            Self::Between => Self::between(left, right).unwrap_or(false),
            Self::NotBetween => Self::between(left, right).map(|inside| !inside).unwrap_or(false),
            Self::Matches => Self::matches(left, right)?,
            Self::All | Self::NotAll | Self::Any | Self::NoneOf => {
                return Err(RuleError::structural(
                    self.as_str(),
                    "逻辑操作符不能用于比较两个值",
                ));
            }
        };
        Ok(matched)
    }

    /// 合并一组子条件结果
    pub fn combine(self, results: &[bool]) -> Result<bool> {
        match self {
            Self::All => Ok(results.iter().all(|r| *r)),
            Self::NotAll => Ok(!results.iter().all(|r| *r)),
            Self::Any => Ok(results.iter().any(|r| *r)),
            Self::NoneOf => Ok(!results.iter().any(|r| *r)),
            _ => Err(RuleError::structural(
                self.as_str(),
                "比较操作符不能用于组合子条件",
            )),
        }
    }

    /// 两侧转为数组后存在严格相等的公共元素
    fn includes(left: &Value, right: &Value) -> bool {
        let left = arrayify(left);
        let right = arrayify(right);
        left.iter().any(|a| right.iter().any(|b| strict_eq(a, b)))
    }

    /// 区间判断，缺失的边界视为无穷；点或边界不是数字时返回 None
    fn between(point: &Value, bounds: &Value) -> Option<bool> {
        let x = as_number(point)?;
        let bounds = arrayify(bounds);
        let min = Self::bound(bounds.first(), f64::NEG_INFINITY)?;
        let max = Self::bound(bounds.get(1), f64::INFINITY)?;
        Some(x >= min && x <= max)
    }

    fn bound(value: Option<&Value>, unbounded: f64) -> Option<f64> {
        match value {
            None | Some(Value::Null) => Some(unbounded),
            Some(v) => as_number(v),
        }
    }

    /// 使用正则缓存比较，MATCHES 以外与 [`Operator::compare`] 相同
    pub fn compare_with(self, left: &Value, right: &Value, patterns: &PatternCache) -> Result<bool> {
        match self {
            Self::Matches => {
                let regex = patterns.get_or_compile(&string_form(right))?;
                Ok(Self::is_match(left, &regex))
            }
            _ => self.compare(left, right),
        }
    }

    fn matches(subject: &Value, pattern: &Value) -> Result<bool> {
        let regex = compile_pattern(&string_form(pattern))?;
        Ok(Self::is_match(subject, &regex))
    }

    /// 左侧不是字符串时直接返回 false
    fn is_match(subject: &Value, regex: &Regex) -> bool {
        matches!(subject, Value::String(subject) if regex.is_match(subject))
    }
}

fn compile_pattern(raw: &str) -> Result<Regex> {
    let pattern = strip_delimiters(raw);
    Regex::new(pattern).map_err(|e| RuleError::invalid_pattern(pattern, e))
}

/// MATCHES 的正则缓存
///
/// 按原始模式文本（含分隔符）索引。有上限且已满时照常编译但不再缓存。
#[derive(Debug, Default)]
pub struct PatternCache {
    patterns: DashMap<String, Arc<Regex>>,
    capacity: Option<usize>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            patterns: DashMap::new(),
            capacity: Some(capacity),
        }
    }

    pub fn get_or_compile(&self, raw: &str) -> Result<Arc<Regex>> {
        if let Some(regex) = self.patterns.get(raw) {
            return Ok(Arc::clone(regex.value()));
        }

        let regex = Arc::new(compile_pattern(raw)?);
        if self.capacity.is_none_or(|cap| self.patterns.len() < cap) {
            let cached = self
                .patterns
                .entry(raw.to_string())
                .or_insert_with(|| Arc::clone(&regex));
            return Ok(Arc::clone(cached.value()));
        }
        Ok(regex)
    }

    pub fn contains(&self, raw: &str) -> bool {
        self.patterns.contains_key(raw)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// 去掉 `/pattern/` 形式的首尾分隔符
pub(crate) fn strip_delimiters(pattern: &str) -> &str {
    if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        &pattern[1..pattern.len() - 1]
    } else {
        pattern
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_uppercase();
        match name.as_str() {
            "EQUALS" => return Ok(Self::Equal),
            "NOT_EQUALS" => return Ok(Self::NotEqual),
            _ => {}
        }
        Self::ALL_OPERATORS
            .into_iter()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| RuleError::UnknownOperator(s.to_string()))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
