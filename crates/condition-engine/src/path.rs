//! 字段路径查询
//!
//! 路径表达式在编译期解析为段列表，执行时返回所有匹配值。
//! 编译结果按表达式文本缓存在 [`PathCache`] 中。
//!
//! 支持的语法：
//! - 可选的前导 `$`
//! - `.name` 或开头的 `name`，以及 `['name']`
//! - `[n]`，负数从末尾计数
//! - `*` / `[*]` 通配
//! - `..name` 递归下降

use crate::error::{Result, RuleError};
use condition_shared::observability::metrics::PATH_QUERY_COMPILATIONS_TOTAL;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    /// 对子树中的每个节点应用选择器
    Descend(Box<Segment>),
}

/// 编译后的路径查询
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    segments: Vec<Segment>,
}

impl PathQuery {
    pub fn compile(expression: &str) -> Result<Self> {
        let segments = Parser::new(expression).parse()?;
        Ok(Self { segments })
    }

    /// 返回所有匹配值
    pub fn execute(&self, record: &Value) -> Vec<Value> {
        let mut nodes = vec![record];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in nodes {
                select(segment, node, &mut next);
            }
            nodes = next;
        }
        nodes.into_iter().cloned().collect()
    }

    /// 第一个匹配值
    pub fn first(&self, record: &Value) -> Option<Value> {
        self.execute(record).into_iter().next()
    }
}

fn select<'a>(segment: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
    match segment {
        Segment::Field(name) => match node {
            Value::Object(map) => out.extend(map.get(name)),
            Value::Array(items) => match name.parse::<i64>() {
                Ok(index) => out.extend(index_of(items, index)),
                // 字段名作用于数组时逐个元素展开
                Err(_) => items.iter().for_each(|item| select(segment, item, out)),
            },
            _ => {}
        },
        Segment::Index(index) => match node {
            Value::Array(items) => out.extend(index_of(items, *index)),
            Value::Object(map) => out.extend(map.get(&index.to_string())),
            _ => {}
        },
        Segment::Wildcard => match node {
            Value::Array(items) => out.extend(items.iter()),
            Value::Object(map) => out.extend(map.values()),
            _ => {}
        },
        Segment::Descend(selector) => {
            let mut subtree = Vec::new();
            walk(node, &mut subtree);
            for candidate in subtree {
                select_direct(selector, candidate, out);
            }
        }
    }
}

/// 递归下降时的选择：字段只匹配对象，下标只匹配数组
fn select_direct<'a>(selector: &Segment, node: &'a Value, out: &mut Vec<&'a Value>) {
    match (selector, node) {
        (Segment::Field(name), Value::Object(map)) => out.extend(map.get(name)),
        (Segment::Index(index), Value::Array(items)) => out.extend(index_of(items, *index)),
        (Segment::Wildcard, _) => select(selector, node, out),
        _ => {}
    }
}

fn walk<'a>(node: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(node);
    match node {
        Value::Array(items) => items.iter().for_each(|item| walk(item, out)),
        Value::Object(map) => map.values().for_each(|item| walk(item, out)),
        _ => {}
    }
}

fn index_of(items: &[Value], index: i64) -> Option<&Value> {
    let resolved = if index < 0 {
        items.len().checked_sub(index.unsigned_abs() as usize)?
    } else {
        index as usize
    };
    items.get(resolved)
}

struct Parser<'a> {
    expression: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(expression: &'a str) -> Self {
        Self {
            expression,
            chars: expression.trim().chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        if self.peek() == Some('$') {
            self.pos += 1;
        } else if self.peek().is_some_and(is_name_char) || self.peek() == Some('*') {
            segments.push(self.name_or_wildcard()?);
        }

        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    if self.peek() == Some('.') {
                        self.pos += 1;
                        let selector = if self.peek() == Some('[') {
                            self.bracket()?
                        } else {
                            self.name_or_wildcard()?
                        };
                        segments.push(Segment::Descend(Box::new(selector)));
                    } else {
                        segments.push(self.name_or_wildcard()?);
                    }
                }
                '[' => segments.push(self.bracket()?),
                other => return Err(self.error(format!("意外的字符 '{}'", other))),
            }
        }
        Ok(segments)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn name_or_wildcard(&mut self) -> Result<Segment> {
        if self.peek() == Some('*') {
            self.pos += 1;
            return Ok(Segment::Wildcard);
        }
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("缺少字段名"));
        }
        Ok(Segment::Field(self.chars[start..self.pos].iter().collect()))
    }

    fn bracket(&mut self) -> Result<Segment> {
        // 跳过 '['
        self.pos += 1;
        let segment = match self.peek() {
            Some('*') => {
                self.pos += 1;
                Segment::Wildcard
            }
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("引号未闭合"));
                }
                let name: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Segment::Field(name)
            }
            _ => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c == '-' || c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                let index = text
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("无效的下标 '{}'", text)))?;
                Segment::Index(index)
            }
        };
        if self.peek() != Some(']') {
            return Err(self.error("缺少 ']'"));
        }
        self.pos += 1;
        Ok(segment)
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::structural(
            format!("path '{}' @{}", self.expression, self.pos),
            message,
        )
    }
}

fn is_name_char(c: char) -> bool {
    !matches!(c, '.' | '[' | ']' | '*' | '\'' | '"') && !c.is_whitespace()
}

/// 按点号路径取单个值（如 "user.profile.age" 或 "items[0].name"）
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.replace('[', ".").replace(']', "");
    let mut current = value;

    for part in normalized.split('.').filter(|p| !p.is_empty()) {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// 路径查询编译缓存
///
/// 以表达式文本为键。设置容量后，缓存满时新表达式照常编译但不再插入。
#[derive(Debug, Default)]
pub struct PathCache {
    queries: DashMap<String, Arc<PathQuery>>,
    capacity: Option<usize>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            queries: DashMap::new(),
            capacity: Some(capacity),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// 获取已编译的查询，未命中时编译
    pub fn get_or_compile(&self, expression: &str) -> Result<Arc<PathQuery>> {
        if let Some(query) = self.queries.get(expression) {
            return Ok(Arc::clone(query.value()));
        }

        let query = Arc::new(PathQuery::compile(expression)?);
        metrics::counter!(PATH_QUERY_COMPILATIONS_TOTAL).increment(1);
        debug!(expression, "路径查询已编译");

        if self.capacity.is_none_or(|cap| self.queries.len() < cap) {
            let cached = self
                .queries
                .entry(expression.to_string())
                .or_insert_with(|| Arc::clone(&query));
            return Ok(Arc::clone(cached.value()));
        }
        Ok(query)
    }

    pub fn contains(&self, expression: &str) -> bool {
        self.queries.contains_key(expression)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn clear(&self) {
        self.queries.clear();
    }
}
