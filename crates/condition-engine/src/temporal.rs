//! 日期时间处理
//!
//! 记录中的日期以字符串或毫秒时间戳出现，这里统一解析为 UTC 时间。

use chrono::{
    DateTime, Duration, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// 相对日期关键字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelativeDate {
    Today,
    Yesterday,
    Tomorrow,
}

impl RelativeDate {
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword {
            "today" => Some(Self::Today),
            "yesterday" => Some(Self::Yesterday),
            "tomorrow" => Some(Self::Tomorrow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Yesterday => "yesterday",
            Self::Tomorrow => "tomorrow",
        }
    }

    pub fn resolve(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self {
            Self::Today => now,
            Self::Yesterday => now - Duration::days(1),
            Self::Tomorrow => now + Duration::days(1),
        }
    }
}

/// 解析日期时间
///
/// 支持 RFC 3339、`YYYY-MM-DD HH:MM:SS`、`YYYY-MM-DDTHH:MM:SS`、`YYYY-MM-DD`
/// 以及毫秒时间戳，无时区信息的按 UTC 处理。
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime_str(s.trim()),
        Value::Number(n) => n
            .as_f64()
            .filter(|ms| ms.is_finite())
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()),
        _ => None,
    }
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// 字符串形式的日期值（数字不算）
pub fn is_date_value(value: &Value) -> bool {
    matches!(value, Value::String(s) if parse_datetime_str(s.trim()).is_some())
}

pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn datetime_value(dt: &DateTime<Utc>) -> Value {
    Value::String(format_datetime(dt))
}

/// 是否为同一个 UTC 日历日
pub fn same_day(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

/// 按增量平移时间
///
/// 增量为对象时按 `years`/`months`/`weeks`/`days`/`hours`/`minutes`/`seconds`
/// 字段累加，为数字时视为秒数。`sign` 为 -1 时反向平移。
pub fn shift(dt: DateTime<Utc>, delta: &Value, sign: i64) -> Option<DateTime<Utc>> {
    match delta {
        Value::Number(n) => {
            let millis = whole((n.as_f64()? * 1000.0).round())?.checked_mul(sign)?;
            dt.checked_add_signed(Duration::try_milliseconds(millis)?)
        }
        Value::Object(fields) => {
            let get = |key: &str| match fields.get(key).and_then(Value::as_f64) {
                Some(value) => whole(value),
                None => Some(0),
            };

            let months = get("years")?
                .checked_mul(12)?
                .checked_add(get("months")?)?
                .checked_mul(sign)?;
            let step = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            let shifted = if months >= 0 {
                dt.checked_add_months(step)?
            } else {
                dt.checked_sub_months(step)?
            };

            let duration = Duration::try_weeks(get("weeks")?.checked_mul(sign)?)?
                .checked_add(&Duration::try_days(get("days")?.checked_mul(sign)?)?)?
                .checked_add(&Duration::try_hours(get("hours")?.checked_mul(sign)?)?)?
                .checked_add(&Duration::try_minutes(get("minutes")?.checked_mul(sign)?)?)?
                .checked_add(&Duration::try_seconds(get("seconds")?.checked_mul(sign)?)?)?;
            shifted.checked_add_signed(duration)
        }
        _ => None,
    }
}

/// 截断到 i64，非有限值或超出范围时返回 None
fn whole(value: f64) -> Option<i64> {
    let value = value.trunc();
    (value.is_finite() && value.abs() < i64::MAX as f64).then_some(value as i64)
}

/// 按 `yyyy-LL-dd` 风格的格式串解析日期
pub fn parse_with_format(input: &str, format: &str) -> Option<DateTime<Utc>> {
    let pattern = translate_format(format);
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, &pattern) {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(input, &pattern)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// 将 Unicode 日期格式标记转换为 strftime 格式
fn translate_format(format: &str) -> String {
    const TOKENS: [(&str, &str); 14] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("LL", "%m"),
        ("MM", "%m"),
        ("L", "%m"),
        ("M", "%m"),
        ("dd", "%d"),
        ("d", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("a", "%p"),
        ("%", "%%"),
    ];

    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}
