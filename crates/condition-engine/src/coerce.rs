//! 值的类型转换工具
//!
//! 操作符与变换管道共用的宽松类型转换规则。记录中的值都是
//! `serde_json::Value`，这里统一约定数字识别、字符串化和真值判断。

use serde_json::{Number, Value};
use std::cmp::Ordering;

/// 判断值是否可以按数字处理
///
/// 数字本身，或去除首尾空白后非空且能解析为有限浮点数的字符串。
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// 强制数字转换：null 为 0，布尔为 0/1，空字符串为 0，单元素数组取其元素
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(_) => as_number(value),
        Value::Array(items) => match items.as_slice() {
            [] => Some(0.0),
            [single] => to_number(single),
            _ => None,
        },
        Value::Object(_) => None,
    }
}

/// 将浮点数转换回 JSON 值，整数值保持整数形式，非有限值变为 null
pub fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

pub fn number_string(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// 值的字符串形式
pub fn string_form(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.as_f64().map(number_string).unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => string_form(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// 严格相等：类型相同且值相同，数字按浮点数比较（2 与 2.0 相等）
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// 宽松相等：允许数字、字符串、布尔之间的转换比较
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    if strict_eq(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (to_number(a), to_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Bool(_), _) => to_number(a).is_some_and(|x| loose_eq(&number_value(x), b)),
        (_, Value::Bool(_)) => to_number(b).is_some_and(|y| loose_eq(a, &number_value(y))),
        (Value::Array(_) | Value::Object(_), Value::String(_) | Value::Number(_)) => {
            loose_eq(&Value::String(string_form(a)), b)
        }
        (Value::String(_) | Value::Number(_), Value::Array(_) | Value::Object(_)) => {
            loose_eq(a, &Value::String(string_form(b)))
        }
        _ => false,
    }
}

/// 通用排序比较
///
/// 两侧都能识别为数字时按数值比较，否则按字符串形式的字典序比较。
pub fn compare_order(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(string_form(a).cmp(&string_form(b))),
    }
}

/// 数组保持不变，null 变为空数组，其他值包装为单元素数组
pub fn arrayify(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// 递归展开嵌套数组
pub fn flatten(value: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten_into(item, out)),
        other => out.push(other.clone()),
    }
}

/// 值为 null 时视同缺失
pub fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}
