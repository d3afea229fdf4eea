//! 条件编译器
//!
//! 将条件树递归编译为闭包。取值来源、路径查询和变换在编译期准备好，
//! 子条件通过各自的 `compile` 复用已缓存的评估函数。

use crate::coerce::{arrayify, is_absent};
use crate::condition::{Condition, ConditionTest};
use crate::error::{Result, RuleError};
use crate::evaluator::Evaluator;
use crate::models::{ConditionType, Environment, EvaluationResult};
use crate::operators::Operator;
use crate::source::{compile_source, Source, SourceKind, Sourcer};
use crate::temporal::{datetime_value, parse_datetime, same_day};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

type Test = Box<dyn Fn(&Value, &Environment) -> Result<EvaluationResult> + Send + Sync>;
type Variables = Box<dyn Fn(&Value, &Environment) -> Environment + Send + Sync>;

/// 编译整个节点：变量、依赖门控和主测试
pub(crate) fn build(condition: &Condition) -> Result<Evaluator> {
    let variables = build_variables(condition)?;
    let dependencies = condition
        .dependencies()
        .iter()
        .map(|dependency| dependency.compile(false))
        .collect::<Result<Vec<_>>>()?;
    let main = build_main(condition)?;

    let kind = condition.kind();
    let operator = condition.operator();

    Ok(Evaluator::new(move |record, environment| {
        let env = variables(record, environment);
        if dependencies.is_empty() {
            return main(record, &env);
        }

        let traces = dependencies
            .iter()
            .map(|dependency| dependency.call(record, &env))
            .collect::<Result<Vec<_>>>()?;
        let passed = traces.iter().all(|trace| trace.result);

        // 依赖未满足时主测试不执行，节点视为通过
        let mut result = if passed {
            main(record, &env)?
        } else {
            EvaluationResult::new(kind, operator, env, true)
        };
        result.dependencies = Some(passed);
        result.dependency_conditions = Some(traces);
        Ok(result)
    }))
}

/// 变量在调用方环境之下：同名时调用方传入的值优先
fn build_variables(condition: &Condition) -> Result<Variables> {
    if condition.variables().is_empty() {
        return Ok(Box::new(|_: &Value, env: &Environment| env.clone()));
    }

    let sourcers = condition
        .variables()
        .iter()
        .map(|(name, source)| {
            let sourcer = compile_source(Some(source), condition.kind(), condition.context())?;
            Ok((name.clone(), sourcer))
        })
        .collect::<Result<Vec<(String, Sourcer)>>>()?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let mut merged = Environment::new();
        for (name, sourcer) in &sourcers {
            merged.insert(name.clone(), sourcer(record, env).unwrap_or(Value::Null));
        }
        for (name, value) in env {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }))
}

fn build_main(condition: &Condition) -> Result<Test> {
    let kind = condition.kind();
    let operator = condition.operator();

    match condition.test() {
        ConditionTest::Compound { conditions } => build_compound(operator, conditions),
        ConditionTest::Iterate { left, conditions } => {
            build_iterate(condition, operator, left.as_ref(), conditions)
        }
        _ if condition.is_empty() => Ok(Box::new(|_: &Value, _: &Environment| Ok(EvaluationResult::pass()))),
        ConditionTest::Primitive { left, right } => {
            build_primitive(condition, operator, left.as_ref(), right.as_ref())
        }
        ConditionTest::Date { left, right } | ConditionTest::Time { left, right } => {
            if matches!(
                operator,
                Operator::Between | Operator::Includes | Operator::NotBetween | Operator::NotIncludes
            ) {
                build_temporal_extent(condition, kind, operator, left.as_ref(), right.as_ref())
            } else {
                build_temporal(condition, kind, operator, left.as_ref(), right.as_ref())
            }
        }
        ConditionTest::Exists { left } => build_exists(condition, operator, left.as_ref()),
    }
}

fn node(kind: ConditionType, operator: Operator) -> String {
    format!("{} {}", kind, operator)
}

fn required<'a>(
    source: Option<&'a Source>,
    side: &str,
    kind: ConditionType,
    operator: Operator,
) -> Result<&'a Source> {
    source.ok_or_else(|| RuleError::structural(node(kind, operator), format!("缺少 {}", side)))
}

fn compile_operand(
    condition: &Condition,
    operator: Operator,
    left: Option<&Source>,
    right: Option<&Source>,
) -> Result<(Sourcer, Sourcer)> {
    let kind = condition.kind();
    let left = required(left, "left", kind, operator)?;
    if operator.requires_right() {
        required(right, "right", kind, operator)?;
    }
    Ok((
        compile_source(Some(left), kind, condition.context())?,
        compile_source(right, kind, condition.context())?,
    ))
}

fn build_compound(operator: Operator, conditions: &[Condition]) -> Result<Test> {
    let kind = ConditionType::Compound;
    if conditions.is_empty() {
        return Err(RuleError::structural(node(kind, operator), "复合条件没有子条件"));
    }
    if !operator.is_logical() {
        return Err(RuleError::structural(node(kind, operator), "复合条件需要逻辑操作符"));
    }

    let children = conditions
        .iter()
        .map(|child| child.compile(false))
        .collect::<Result<Vec<_>>>()?;

    // 不短路：每个子条件的追踪都是输出的一部分
    Ok(Box::new(move |record: &Value, env: &Environment| {
        let results = children
            .iter()
            .map(|child| child.call(record, env))
            .collect::<Result<Vec<_>>>()?;
        let outcomes: Vec<bool> = results.iter().map(|r| r.result).collect();
        let result = operator.combine(&outcomes)?;
        Ok(EvaluationResult::new(kind, operator, env.clone(), result).with_results(results))
    }))
}

fn build_iterate(
    condition: &Condition,
    operator: Operator,
    left: Option<&Source>,
    conditions: &[Condition],
) -> Result<Test> {
    let kind = ConditionType::Iterate;
    if conditions.is_empty() {
        return Err(RuleError::structural(node(kind, operator), "迭代条件没有子条件"));
    }
    if !operator.is_logical() {
        return Err(RuleError::structural(node(kind, operator), "迭代条件需要逻辑操作符"));
    }
    let collection = compile_source(
        Some(required(left, "left", kind, operator)?),
        kind,
        condition.context(),
    )?;
    let children = conditions
        .iter()
        .map(|child| child.compile(false))
        .collect::<Result<Vec<_>>>()?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let targets = arrayify(&collection(record, env).unwrap_or(Value::Null));

        let mut elements = Vec::with_capacity(targets.len());
        for target in &targets {
            // 每个元素作为新的记录，环境保持不变
            let results = children
                .iter()
                .map(|child| child.call(target, env))
                .collect::<Result<Vec<_>>>()?;
            let all = results.iter().all(|r| r.result);
            elements.push(
                EvaluationResult::new(kind, Operator::All, env.clone(), all).with_results(results),
            );
        }

        let outcomes: Vec<bool> = elements.iter().map(|r| r.result).collect();
        let result = operator.combine(&outcomes)?;
        Ok(EvaluationResult::new(kind, operator, env.clone(), result)
            .with_targets(targets)
            .with_results(elements))
    }))
}

fn build_primitive(
    condition: &Condition,
    operator: Operator,
    left: Option<&Source>,
    right: Option<&Source>,
) -> Result<Test> {
    let kind = ConditionType::Primitive;
    if operator.is_logical() {
        return Err(RuleError::structural(
            node(kind, operator),
            "逻辑操作符只能用于复合或迭代条件",
        ));
    }
    let pattern_spec = right.map(|source| source.to_value().to_string()).unwrap_or_default();
    let context = Arc::clone(condition.context());
    // 字面量模式在编译期就放进缓存
    if let (Operator::Matches, Some(Source { kind: SourceKind::Value(Value::String(pattern)), mutate })) =
        (operator, right)
    {
        if mutate.is_empty() {
            context
                .patterns()
                .get_or_compile(pattern)
                .map_err(|err| with_pattern_source(&pattern_spec, err))?;
        }
    }
    let (left, right) = compile_operand(condition, operator, left, right)?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let l = left(record, env);
        let r = right(record, env);
        // 任一侧缺失时结果恒为 false
        let result = match (&l, &r) {
            (Some(a), Some(b)) if !is_absent(Some(a)) && !is_absent(Some(b)) => operator
                .compare_with(a, b, context.patterns())
                .map_err(|err| with_pattern_source(&pattern_spec, err))?,
            _ => false,
        };
        Ok(EvaluationResult::new(kind, operator, env.clone(), result)
            .with_left(l)
            .with_right(r))
    }))
}

/// 正则错误附带右侧来源的规范形式
fn with_pattern_source(source_spec: &str, err: RuleError) -> RuleError {
    match err {
        err @ RuleError::InvalidPattern { .. } => RuleError::SourceResolution {
            source_spec: source_spec.to_string(),
            message: err.to_string(),
        },
        err => err,
    }
}

fn temporal_trace(raw: Option<Value>, parsed: Option<&DateTime<Utc>>) -> Option<Value> {
    match parsed {
        Some(dt) => Some(datetime_value(dt)),
        None => raw,
    }
}

/// DATE / TIME 比较
///
/// LT 表示左侧早于右侧，GT 表示左侧晚于右侧，与数值比较的方向一致。
/// DATE 按 UTC 日历日比较，TIME 精确比较。
fn build_temporal(
    condition: &Condition,
    kind: ConditionType,
    operator: Operator,
    left: Option<&Source>,
    right: Option<&Source>,
) -> Result<Test> {
    let supported = matches!(
        operator,
        Operator::Equal | Operator::NotEqual | Operator::Lt | Operator::Gt
    );
    if kind == ConditionType::Time && !supported {
        return Err(RuleError::structural(
            node(kind, operator),
            "时间条件只支持 EQUAL、NOT_EQUAL、LT、GT 和区间操作符",
        ));
    }
    let (left, right) = compile_operand(condition, operator, left, right)?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let l = left(record, env);
        let r = right(record, env);
        let a = l.as_ref().and_then(parse_datetime);
        let b = r.as_ref().and_then(parse_datetime);

        let result = match (&a, &b) {
            (Some(a), Some(b)) if kind == ConditionType::Date => match operator {
                Operator::Equal => same_day(a, b),
                Operator::NotEqual => !same_day(a, b),
                Operator::Lt => !same_day(a, b) && a < b,
                Operator::Gt => !same_day(a, b) && a > b,
                _ => false,
            },
            (Some(a), Some(b)) => match operator {
                Operator::Equal => a == b,
                Operator::NotEqual => a != b,
                Operator::Lt => a < b,
                Operator::Gt => a > b,
                _ => false,
            },
            // 无法解析的日期不参与比较
            _ => false,
        };

        Ok(EvaluationResult::new(kind, operator, env.clone(), result)
            .with_left(temporal_trace(l, a.as_ref()))
            .with_right(temporal_trace(r, b.as_ref())))
    }))
}

fn build_temporal_extent(
    condition: &Condition,
    kind: ConditionType,
    operator: Operator,
    left: Option<&Source>,
    right: Option<&Source>,
) -> Result<Test> {
    let inside = matches!(operator, Operator::Between | Operator::Includes);
    let (left, right) = compile_operand(condition, operator, left, right)?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let l = left(record, env);
        let Some(a) = l.as_ref().and_then(parse_datetime) else {
            return Ok(EvaluationResult::new(kind, operator, env.clone(), false).with_left(l));
        };

        let bounds = arrayify(&right(record, env).unwrap_or(Value::Null));
        let bound = |index: usize| bounds.get(index).and_then(parse_datetime);
        let (b1, b2) = (bound(0), bound(1));

        let outside = if kind == ConditionType::Date {
            b1.is_some_and(|b1| !same_day(&a, &b1) && a < b1)
                || b2.is_some_and(|b2| !same_day(&a, &b2) && a > b2)
        } else {
            b1.is_some_and(|b1| a < b1) || b2.is_some_and(|b2| a > b2)
        };
        let result = if outside { !inside } else { inside };

        let trace_bound = |b: Option<DateTime<Utc>>| b.map(|b| datetime_value(&b)).unwrap_or(Value::Null);
        Ok(EvaluationResult::new(kind, operator, env.clone(), result)
            .with_left(Some(datetime_value(&a)))
            .with_right(Some(Value::Array(vec![trace_bound(b1), trace_bound(b2)]))))
    }))
}

fn build_exists(condition: &Condition, operator: Operator, left: Option<&Source>) -> Result<Test> {
    let kind = ConditionType::Exists;
    let source = required(left, "left", kind, operator)?;
    let left = compile_source(Some(source), kind, condition.context())?;

    Ok(Box::new(move |record: &Value, env: &Environment| {
        let l = left(record, env);
        let present = !is_absent(l.as_ref());
        let result = if operator == Operator::False { !present } else { present };
        Ok(EvaluationResult::new(kind, operator, env.clone(), result).with_left(l))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(value: Value) -> Condition {
        Condition::from_value(&value).unwrap()
    }

    fn evaluate(value: Value, record: Value) -> EvaluationResult {
        condition(value)
            .evaluate(&record, &Environment::new())
            .unwrap()
    }

    #[test]
    fn test_structural_errors() {
        let cases = [
            json!({ "type": "COMPOUND", "operator": "ALL", "conditions": [] , "description": "x" }),
            json!({ "type": "COMPOUND", "operator": "EQUAL", "conditions": [{ "left": 1, "right": 1 }] }),
            json!({ "type": "ITERATE", "operator": "ANY", "left": { "path": "a" } }),
            json!({ "type": "TIME", "operator": "LIKE", "left": { "path": "a" }, "right": 1 }),
            json!({ "type": "PRIMITIVE", "operator": "ALL", "left": 1, "right": 1 }),
            json!({ "type": "PRIMITIVE", "operator": "EQUAL", "right": 1 }),
            json!({ "type": "PRIMITIVE", "operator": "GT", "left": { "path": "a" } }),
        ];
        for case in cases {
            let err = condition(case.clone()).compile(false).unwrap_err();
            assert!(err.is_structural(), "{case} -> {err}");
        }
    }

    #[test]
    fn test_variables_are_overridden_by_caller() {
        let cond = condition(json!({
            "left": { "env": "limit" },
            "operator": "EQUAL",
            "right": 5,
            "variables": { "limit": { "path": "limit" } }
        }));

        let record = json!({ "limit": 5 });
        assert!(cond.evaluate(&record, &Environment::new()).unwrap().result);

        let mut env = Environment::new();
        env.insert("limit".to_string(), json!(7));
        let result = cond.evaluate(&record, &env).unwrap();
        assert!(!result.result);
        assert_eq!(result.environment.unwrap()["limit"], json!(7));
    }

    #[test]
    fn test_iterate_trace() {
        let result = evaluate(
            json!({
                "type": "ITERATE",
                "operator": "ANY",
                "left": { "path": "items" },
                "conditions": [{ "left": { "path": "qty" }, "operator": "GT", "right": 2 }]
            }),
            json!({ "items": [{ "qty": 1 }, { "qty": 3 }] }),
        );
        assert!(result.result);
        assert_eq!(result.targets.as_ref().map(Vec::len), Some(2));
        let elements = result.results.unwrap();
        assert_eq!(elements[0].operator, Some(Operator::All));
        assert_eq!(elements[0].kind, Some(ConditionType::Iterate));
        assert!(!elements[0].result);
        assert!(elements[1].result);
    }

    #[test]
    fn test_iterate_over_scalar_and_missing() {
        let spec = json!({
            "type": "ITERATE",
            "operator": "ALL",
            "left": { "path": "items" },
            "conditions": [{ "left": {}, "operator": "GT", "right": 2 }]
        });
        assert!(evaluate(spec.clone(), json!({ "items": 5 })).result);
        // 空集合上 ALL 为真，ANY 为假
        assert!(evaluate(spec, json!({})).result);
    }

    #[test]
    fn test_date_comparisons() {
        let date = |op: &str, left: &str, right: &str| {
            evaluate(
                json!({ "type": "DATE", "operator": op, "left": { "value": left }, "right": { "value": right } }),
                json!({}),
            )
            .result
        };
        assert!(date("EQUAL", "2024-03-01T01:00:00Z", "2024-03-01T23:00:00Z"));
        assert!(!date("NOT_EQUAL", "2024-03-01T01:00:00Z", "2024-03-01T23:00:00Z"));
        assert!(date("LT", "2024-02-28", "2024-03-01"));
        assert!(!date("LT", "2024-03-01T01:00:00Z", "2024-03-01T23:00:00Z"));
        assert!(date("GT", "2024-03-02", "2024-03-01"));
        assert!(!date("LT", "2024-03-02", "2024-03-01"));
        assert!(!date("EQUAL", "garbage", "2024-03-01"));
        assert!(!date("LIKE", "2024-03-01", "2024-03-01"));
    }

    #[test]
    fn test_time_comparisons() {
        let time = |op: &str, left: &str, right: &str| {
            evaluate(
                json!({ "type": "TIME", "operator": op, "left": { "value": left }, "right": { "value": right } }),
                json!({}),
            )
            .result
        };
        assert!(!time("EQUAL", "2024-03-01T01:00:00Z", "2024-03-01T23:00:00Z"));
        assert!(time("EQUAL", "2024-03-01T09:00:00+08:00", "2024-03-01T01:00:00Z"));
        assert!(time("LT", "2024-03-01T01:00:00Z", "2024-03-01T23:00:00Z"));
        assert!(time("GT", "2024-03-01T23:00:00Z", "2024-03-01T01:00:00Z"));
    }

    #[test]
    fn test_temporal_extents() {
        let extent = |kind: &str, op: &str, point: &str, bounds: Value| {
            evaluate(
                json!({
                    "type": kind,
                    "operator": op,
                    "left": { "value": point },
                    "right": { "between": { "left": { "value": bounds[0] }, "right": { "value": bounds[1] } } }
                }),
                json!({}),
            )
            .result
        };
        let bounds = json!(["2024-03-01T12:00:00Z", "2024-03-10T12:00:00Z"]);
        assert!(extent("DATE", "BETWEEN", "2024-03-05", bounds.clone()));
        // 同一天按天粒度视为在区间内
        assert!(extent("DATE", "BETWEEN", "2024-03-01T01:00:00Z", bounds.clone()));
        assert!(!extent("TIME", "BETWEEN", "2024-03-01T01:00:00Z", bounds.clone()));
        assert!(extent("DATE", "NOT_BETWEEN", "2024-02-01", bounds.clone()));
        assert!(extent("TIME", "NOT_INCLUDES", "2024-03-11", bounds.clone()));
        assert!(extent("DATE", "INCLUDES", "2030-01-01", json!(["2024-03-01", null])));
        assert!(!extent("DATE", "BETWEEN", "nope", bounds));
    }

    #[test]
    fn test_exists() {
        let spec = |op: &str| json!({ "type": "EXISTS", "operator": op, "left": { "path": "a" } });
        assert!(evaluate(spec("TRUE"), json!({ "a": 0 })).result);
        assert!(!evaluate(spec("TRUE"), json!({ "a": null })).result);
        assert!(evaluate(spec("FALSE"), json!({})).result);
    }

    #[test]
    fn test_literal_pattern_compiled_once() {
        let cond = condition(json!({ "left": { "path": "name" }, "operator": "MATCHES", "right": "/^al/" }));
        cond.compile(false).unwrap();
        assert!(cond.context().patterns().contains("/^al/"));

        for name in ["alice", "albert", "bob"] {
            let result = cond.evaluate(&json!({ "name": name }), &Environment::new()).unwrap();
            assert_eq!(result.result, name.starts_with("al"));
        }
        assert_eq!(cond.context().patterns().len(), 1);
    }

    #[test]
    fn test_malformed_pattern_carries_source() {
        let err = condition(json!({ "left": { "path": "name" }, "operator": "MATCHES", "right": "[bad" }))
            .compile(false)
            .unwrap_err();
        match err {
            RuleError::SourceResolution { source_spec, .. } => assert!(source_spec.contains("[bad")),
            other => panic!("unexpected error: {other}"),
        }

        let cond = condition(json!({
            "left": { "path": "name" },
            "operator": "MATCHES",
            "right": { "path": "pattern" }
        }));
        let err = cond
            .evaluate(&json!({ "name": "abc", "pattern": "(" }), &Environment::new())
            .unwrap_err();
        match err {
            RuleError::SourceResolution { source_spec, message } => {
                assert!(source_spec.contains("pattern"));
                assert!(message.contains("("));
            }
            other => panic!("unexpected error: {other}"),
        }
        let ok = cond
            .evaluate(&json!({ "name": "abc", "pattern": "b" }), &Environment::new())
            .unwrap();
        assert!(ok.result);
    }
}
