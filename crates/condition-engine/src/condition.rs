//! 条件树
//!
//! [`Condition`] 是条件树的节点，拥有自己的子条件和依赖。
//! 编译结果按结构哈希做单槽缓存：结构未变时重复编译返回同一个评估函数，
//! 任何字段修改都会使哈希变化，从而在下一次编译时重建该节点及其祖先。

use crate::compiler;
use crate::context::EngineContext;
use crate::error::{Result, RuleError};
use crate::evaluator::Evaluator;
use crate::models::{ConditionDef, ConditionType, Environment, EvaluationResult};
use crate::operators::Operator;
use crate::source::Source;
use condition_shared::observability::metrics::CONDITION_COMPILATIONS_TOTAL;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// 按类型区分的主测试
///
/// 每种类型只携带它需要的字段：COMPOUND 没有 left，ITERATE 和 EXISTS 没有 right。
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTest {
    Primitive {
        left: Option<Source>,
        right: Option<Source>,
    },
    Date {
        left: Option<Source>,
        right: Option<Source>,
    },
    Time {
        left: Option<Source>,
        right: Option<Source>,
    },
    Compound {
        conditions: Vec<Condition>,
    },
    Iterate {
        left: Option<Source>,
        conditions: Vec<Condition>,
    },
    Exists {
        left: Option<Source>,
    },
}

impl ConditionTest {
    pub fn kind(&self) -> ConditionType {
        match self {
            Self::Primitive { .. } => ConditionType::Primitive,
            Self::Date { .. } => ConditionType::Date,
            Self::Time { .. } => ConditionType::Time,
            Self::Compound { .. } => ConditionType::Compound,
            Self::Iterate { .. } => ConditionType::Iterate,
            Self::Exists { .. } => ConditionType::Exists,
        }
    }
}

#[derive(Debug, Clone)]
struct Memo {
    hash: String,
    evaluator: Evaluator,
}

/// 条件节点
#[derive(Debug)]
pub struct Condition {
    test: ConditionTest,
    operator: Operator,
    dependencies: Vec<Condition>,
    variables: BTreeMap<String, Source>,
    description: Option<String>,
    context: Arc<EngineContext>,
    memo: Mutex<Option<Memo>>,
}

impl Condition {
    pub fn new(test: ConditionTest, operator: Operator) -> Self {
        Self {
            test,
            operator,
            dependencies: Vec::new(),
            variables: BTreeMap::new(),
            description: None,
            context: Arc::new(EngineContext::default()),
            memo: Mutex::new(None),
        }
    }

    // ---- 构造 ----

    /// 所有子条件都成立
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::new(ConditionTest::Compound { conditions }, Operator::All)
    }

    /// 至少一个子条件成立
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::new(ConditionTest::Compound { conditions }, Operator::Any)
    }

    /// 没有子条件成立
    pub fn none(conditions: Vec<Condition>) -> Self {
        Self::new(ConditionTest::Compound { conditions }, Operator::NoneOf)
    }

    /// 比较两个来源，只适用于 PRIMITIVE、DATE、TIME
    pub fn compare(kind: ConditionType, left: Source, operator: Operator, right: Source) -> Result<Self> {
        let (left, right) = (Some(left), Some(right));
        let test = match kind {
            ConditionType::Primitive => ConditionTest::Primitive { left, right },
            ConditionType::Date => ConditionTest::Date { left, right },
            ConditionType::Time => ConditionTest::Time { left, right },
            other => {
                return Err(RuleError::structural(
                    format!("{} {}", other, operator),
                    "compare 只支持 PRIMITIVE、DATE、TIME",
                ));
            }
        };
        Ok(Self::new(test, operator))
    }

    /// 记录路径上的值与字面量比较
    pub fn simple(path: &str, value: impl Into<Value>, operator: Operator) -> Self {
        Self::new(
            ConditionTest::Primitive {
                left: Some(Source::path(path)),
                right: Some(Source::value(value)),
            },
            operator,
        )
    }

    /// 记录路径上的字符串匹配正则
    pub fn matches(path: &str, pattern: &str) -> Self {
        Self::simple(path, pattern, Operator::Matches)
    }

    /// 对集合中的每个元素检查子条件
    pub fn iterate(left: Source, operator: Operator, conditions: Vec<Condition>) -> Self {
        Self::new(
            ConditionTest::Iterate {
                left: Some(left),
                conditions,
            },
            operator,
        )
    }

    pub fn with_dependency(mut self, dependency: Condition) -> Self {
        self.dependencies.push(dependency.with_context(self.context.clone()));
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, source: Source) -> Self {
        self.variables.insert(name.into(), source);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 替换整棵树的引擎上下文
    pub fn with_context(mut self, context: Arc<EngineContext>) -> Self {
        self.apply_context(&context);
        self
    }

    fn apply_context(&mut self, context: &Arc<EngineContext>) {
        self.context = context.clone();
        *self.memo.get_mut() = None;
        for child in self.dependencies.iter_mut() {
            child.apply_context(context);
        }
        if let Some(children) = self.conditions_mut() {
            for child in children.iter_mut() {
                child.apply_context(context);
            }
        }
    }

    // ---- 纯数据转换 ----

    pub fn from_def(def: &ConditionDef) -> Result<Self> {
        Self::from_def_with_context(def, Arc::new(EngineContext::default()))
    }

    /// 递归转换，子条件共享同一个上下文
    pub fn from_def_with_context(def: &ConditionDef, context: Arc<EngineContext>) -> Result<Self> {
        let kind = match def.kind.as_deref() {
            Some(name) => name.parse::<ConditionType>()?,
            None => ConditionType::Primitive,
        };
        let operator = match def.operator.as_deref() {
            Some(name) => name.parse::<Operator>()?,
            None => Operator::Equal,
        };
        let node = || format!("{} {}", kind, operator);

        let left = def.left.as_ref().map(Source::from_value).transpose()?;
        let right = def.right.as_ref().map(Source::from_value).transpose()?;
        let children = |defs: &Option<Vec<ConditionDef>>| -> Result<Vec<Condition>> {
            defs.iter()
                .flatten()
                .map(|child| Self::from_def_with_context(child, context.clone()))
                .collect()
        };
        let conditions = children(&def.conditions)?;

        let test = match kind {
            ConditionType::Compound => {
                if left.is_some() || right.is_some() {
                    return Err(RuleError::structural(node(), "复合条件不能有 left 或 right"));
                }
                ConditionTest::Compound { conditions }
            }
            ConditionType::Iterate => {
                if right.is_some() {
                    return Err(RuleError::structural(node(), "迭代条件不能有 right"));
                }
                ConditionTest::Iterate { left, conditions }
            }
            other => {
                if !conditions.is_empty() {
                    return Err(RuleError::structural(node(), "只有复合或迭代条件可以包含子条件"));
                }
                match other {
                    ConditionType::Exists if right.is_some() => {
                        return Err(RuleError::structural(node(), "存在性条件不能有 right"));
                    }
                    ConditionType::Exists => ConditionTest::Exists { left },
                    ConditionType::Date => ConditionTest::Date { left, right },
                    ConditionType::Time => ConditionTest::Time { left, right },
                    _ => ConditionTest::Primitive { left, right },
                }
            }
        };

        let mut variables = BTreeMap::new();
        for (name, spec) in def.variables.iter().flatten() {
            if spec.is_null() {
                continue;
            }
            variables.insert(name.clone(), Source::from_value(spec)?);
        }

        let dependencies = children(&def.dependencies)?;

        Ok(Self {
            test,
            operator,
            dependencies,
            variables,
            description: def.description.clone(),
            context,
            memo: Mutex::new(None),
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let def: ConditionDef = serde_json::from_value(value.clone())?;
        Self::from_def(&def)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_def(&ConditionDef::from_json(json)?)
    }

    /// 规范的纯数据形式，省略空的来源、子条件和变量
    pub fn to_def(&self) -> ConditionDef {
        let defs = |children: &[Condition]| -> Option<Vec<ConditionDef>> {
            (!children.is_empty()).then(|| children.iter().map(Condition::to_def).collect())
        };
        let variables = (!self.variables.is_empty()).then(|| {
            self.variables
                .iter()
                .map(|(name, source)| (name.clone(), source.to_value()))
                .collect::<Map<String, Value>>()
        });

        ConditionDef {
            description: self.description.clone(),
            left: self.left().map(Source::to_value),
            right: self.right().map(Source::to_value),
            kind: Some(self.kind().as_str().to_string()),
            operator: Some(self.operator.as_str().to_string()),
            variables,
            dependencies: defs(&self.dependencies),
            conditions: defs(self.conditions()),
        }
    }

    // ---- 编译与求值 ----

    /// 结构哈希
    ///
    /// 覆盖 left、right、类型、操作符、变量以及子条件和依赖的哈希，不含描述。
    pub fn structural_hash(&self) -> String {
        let hashes = |children: &[Condition]| -> Vec<Value> {
            children
                .iter()
                .map(|child| Value::String(child.structural_hash()))
                .collect()
        };
        let variables: Map<String, Value> = self
            .variables
            .iter()
            .map(|(name, source)| (name.clone(), source.to_value()))
            .collect();

        let canonical = json!({
            "left": self.left().map(Source::to_value),
            "right": self.right().map(Source::to_value),
            "type": self.kind().as_str(),
            "operator": self.operator.as_str(),
            "variables": variables,
            "dependencies": hashes(&self.dependencies),
            "conditions": hashes(self.conditions()),
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 编译为评估函数
    ///
    /// `force` 为 false 时，结构哈希与上次编译相同则直接返回缓存的函数；
    /// 为 true 时总是重新构建，且不读写缓存。
    pub fn compile(&self, force: bool) -> Result<Evaluator> {
        if force {
            let evaluator = compiler::build(self)?;
            metrics::counter!(CONDITION_COMPILATIONS_TOTAL, "cache" => "forced").increment(1);
            return Ok(evaluator);
        }

        let hash = self.structural_hash();
        if let Some(memo) = self.memo.lock().as_ref().filter(|memo| memo.hash == hash) {
            metrics::counter!(CONDITION_COMPILATIONS_TOTAL, "cache" => "hit").increment(1);
            debug!(hash = %hash, "复用已编译的条件");
            return Ok(memo.evaluator.clone());
        }

        // 在锁外构建，并发编译最多造成重复构建
        let evaluator = compiler::build(self)?;
        *self.memo.lock() = Some(Memo {
            hash: hash.clone(),
            evaluator: evaluator.clone(),
        });
        metrics::counter!(CONDITION_COMPILATIONS_TOTAL, "cache" => "miss").increment(1);
        debug!(hash = %hash, kind = %self.kind(), "条件已编译");
        Ok(evaluator)
    }

    pub fn evaluate(&self, record: &Value, environment: &Environment) -> Result<EvaluationResult> {
        self.compile(false)?.evaluate(record, environment)
    }

    /// 空条件直接通过，不经过编译
    pub fn evaluate_or_true(&self, record: &Value, environment: &Environment) -> Result<EvaluationResult> {
        if self.is_empty() {
            return Ok(EvaluationResult::pass());
        }
        self.evaluate(record, environment)
    }

    /// 没有 left、right 和子条件
    pub fn is_empty(&self) -> bool {
        self.left().is_none() && self.right().is_none() && self.conditions().is_empty()
    }

    /// 树的深度，单个节点为 1
    pub fn depth(&self) -> usize {
        1 + self
            .conditions()
            .iter()
            .chain(self.dependencies.iter())
            .map(Condition::depth)
            .max()
            .unwrap_or(0)
    }

    // ---- 访问 ----

    pub fn kind(&self) -> ConditionType {
        self.test.kind()
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn test(&self) -> &ConditionTest {
        &self.test
    }

    pub fn left(&self) -> Option<&Source> {
        match &self.test {
            ConditionTest::Primitive { left, .. }
            | ConditionTest::Date { left, .. }
            | ConditionTest::Time { left, .. }
            | ConditionTest::Iterate { left, .. }
            | ConditionTest::Exists { left } => left.as_ref(),
            ConditionTest::Compound { .. } => None,
        }
    }

    pub fn right(&self) -> Option<&Source> {
        match &self.test {
            ConditionTest::Primitive { right, .. }
            | ConditionTest::Date { right, .. }
            | ConditionTest::Time { right, .. } => right.as_ref(),
            _ => None,
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        match &self.test {
            ConditionTest::Compound { conditions } | ConditionTest::Iterate { conditions, .. } => {
                conditions
            }
            _ => &[],
        }
    }

    pub fn dependencies(&self) -> &[Condition] {
        &self.dependencies
    }

    pub fn variables(&self) -> &BTreeMap<String, Source> {
        &self.variables
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    // ---- 编辑 ----

    pub fn set_operator(&mut self, operator: Operator) {
        self.operator = operator;
    }

    pub fn set_left(&mut self, source: Option<Source>) -> Result<()> {
        let node = format!("{} {}", self.kind(), self.operator);
        match &mut self.test {
            ConditionTest::Primitive { left, .. }
            | ConditionTest::Date { left, .. }
            | ConditionTest::Time { left, .. }
            | ConditionTest::Iterate { left, .. }
            | ConditionTest::Exists { left } => {
                *left = source;
                Ok(())
            }
            ConditionTest::Compound { .. } => Err(RuleError::structural(node, "复合条件不能有 left")),
        }
    }

    pub fn set_right(&mut self, source: Option<Source>) -> Result<()> {
        let node = format!("{} {}", self.kind(), self.operator);
        match &mut self.test {
            ConditionTest::Primitive { right, .. }
            | ConditionTest::Date { right, .. }
            | ConditionTest::Time { right, .. } => {
                *right = source;
                Ok(())
            }
            _ => Err(RuleError::structural(node, "该类型的条件不能有 right")),
        }
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
    }

    pub fn set_variable(&mut self, name: impl Into<String>, source: Source) {
        self.variables.insert(name.into(), source);
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Source> {
        self.variables.remove(name)
    }

    /// 子条件的可变引用，只有 COMPOUND 和 ITERATE 有子条件
    pub fn conditions_mut(&mut self) -> Option<&mut Vec<Condition>> {
        match &mut self.test {
            ConditionTest::Compound { conditions } | ConditionTest::Iterate { conditions, .. } => {
                Some(conditions)
            }
            _ => None,
        }
    }

    pub fn dependencies_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.dependencies
    }
}

impl Clone for Condition {
    fn clone(&self) -> Self {
        Self {
            test: self.test.clone(),
            operator: self.operator,
            dependencies: self.dependencies.clone(),
            variables: self.variables.clone(),
            description: self.description.clone(),
            context: self.context.clone(),
            memo: Mutex::new(self.memo.lock().clone()),
        }
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.to_def() == other.to_def()
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_def().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let def = ConditionDef::deserialize(deserializer)?;
        Self::from_def(&def).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Value {
        json!({ "b": { "e": 2, "g": "2" }, "tags": ["x", "y"] })
    }

    #[test]
    fn test_defaults_when_type_and_operator_missing() {
        let cond = Condition::from_value(&json!({ "left": { "path": "b.e" }, "right": 2 })).unwrap();
        assert_eq!(cond.kind(), ConditionType::Primitive);
        assert_eq!(cond.operator(), Operator::Equal);
        assert!(cond.evaluate(&record(), &Environment::new()).unwrap().result);
    }

    #[test]
    fn test_unknown_names() {
        let err = Condition::from_value(&json!({ "type": "FANCY" })).unwrap_err();
        assert!(matches!(err, RuleError::UnknownType(_)));

        let err = Condition::from_value(&json!({ "operator": "ROUGHLY" })).unwrap_err();
        assert!(matches!(err, RuleError::UnknownOperator(_)));
    }

    #[test]
    fn test_invalid_shapes() {
        let cases = [
            json!({ "type": "COMPOUND", "operator": "ALL", "left": 1, "conditions": [{}] }),
            json!({ "type": "ITERATE", "operator": "ALL", "left": 1, "right": 1, "conditions": [{}] }),
            json!({ "type": "EXISTS", "operator": "TRUE", "left": 1, "right": 1 }),
            json!({ "type": "PRIMITIVE", "left": 1, "right": 1, "conditions": [{}] }),
        ];
        for case in cases {
            let err = Condition::from_value(&case).unwrap_err();
            assert!(err.is_structural(), "{case}");
        }
    }

    #[test]
    fn test_round_trip_keeps_hash() {
        let spec = json!({
            "type": "COMPOUND",
            "operator": "ANY",
            "description": "vip",
            "variables": { "limit": { "value": 3 }, "skip": null },
            "dependencies": [{ "type": "EXISTS", "operator": "TRUE", "left": { "path": "b" } }],
            "conditions": [
                { "left": { "get": "b.e", "mutate": { "type": "ADD", "value": 1 } }, "operator": "GT", "right": { "env": "limit" } },
                { "type": "ITERATE", "operator": "ALL", "left": { "collect": "tags" }, "conditions": [{ "left": {}, "operator": "LIKE", "right": "x" }] }
            ]
        });
        let cond = Condition::from_value(&spec).unwrap();
        assert_eq!(cond.variables().len(), 1);

        let projected = serde_json::to_value(&cond).unwrap();
        assert!(projected.get("right").is_none());
        let back: Condition = serde_json::from_value(projected).unwrap();
        assert_eq!(back.structural_hash(), cond.structural_hash());
        assert_eq!(back, cond);
    }

    #[test]
    fn test_hash_ignores_description() {
        let a = Condition::simple("b.e", 2, Operator::Equal);
        let b = a.clone().with_description("two");
        assert_eq!(a.structural_hash(), b.structural_hash());

        let c = Condition::simple("b.e", 3, Operator::Equal);
        assert_ne!(a.structural_hash(), c.structural_hash());
    }

    #[test]
    fn test_memo_single_slot() {
        let mut cond = Condition::simple("b.e", 2, Operator::Equal);
        let first = cond.compile(false).unwrap();
        assert!(Evaluator::ptr_eq(&first, &cond.compile(false).unwrap()));
        assert!(!Evaluator::ptr_eq(&first, &cond.compile(true).unwrap()));
        // 强制编译不更新缓存
        assert!(Evaluator::ptr_eq(&first, &cond.compile(false).unwrap()));

        cond.set_operator(Operator::NotEqual);
        let second = cond.compile(false).unwrap();
        assert!(!Evaluator::ptr_eq(&first, &second));
        assert!(!second.evaluate_record(&record()).unwrap().result);

        // 单槽：改回后不会复用第一次的结果
        cond.set_operator(Operator::Equal);
        assert!(!Evaluator::ptr_eq(&first, &cond.compile(false).unwrap()));
    }

    #[test]
    fn test_child_edit_invalidates_ancestors() {
        let mut cond = Condition::all(vec![
            Condition::simple("b.e", 2, Operator::Equal),
            Condition::simple("b.g", "2", Operator::Equal),
        ]);
        let before = cond.compile(false).unwrap();
        assert!(before.evaluate_record(&record()).unwrap().result);

        if let Some(children) = cond.conditions_mut() {
            children[1].set_right(Some(Source::value("3"))).unwrap();
        }
        let after = cond.compile(false).unwrap();
        assert!(!Evaluator::ptr_eq(&before, &after));
        assert!(!after.evaluate_record(&record()).unwrap().result);
    }

    #[test]
    fn test_editing_rules() {
        let mut compound = Condition::any(vec![Condition::simple("b.e", 2, Operator::Equal)]);
        assert!(compound.set_left(Some(Source::value(1))).is_err());
        assert!(compound.set_right(Some(Source::value(1))).is_err());

        let mut exists = Condition::new(ConditionTest::Exists { left: None }, Operator::True);
        exists.set_left(Some(Source::path("b.e"))).unwrap();
        assert!(exists.set_right(Some(Source::value(1))).is_err());
        assert!(exists.evaluate(&record(), &Environment::new()).unwrap().result);

        let mut cond = Condition::simple("b.e", 2, Operator::Equal);
        cond.set_variable("x", Source::value(1));
        assert!(cond.remove_variable("x").is_some());
        assert!(cond.remove_variable("x").is_none());
    }

    #[test]
    fn test_constructors() {
        assert!(Condition::matches("b.g", "/^\\d$/")
            .evaluate(&record(), &Environment::new())
            .unwrap()
            .result);
        assert_eq!(Condition::none(vec![]).operator(), Operator::NoneOf);
        assert!(Condition::compare(
            ConditionType::Exists,
            Source::path("b"),
            Operator::True,
            Source::value(1)
        )
        .is_err());

        let iterate = Condition::iterate(
            Source::path("tags"),
            Operator::Any,
            vec![Condition::new(
                ConditionTest::Primitive {
                    left: Some(Source::passthrough()),
                    right: Some(Source::value("y")),
                },
                Operator::Equal,
            )],
        );
        assert!(iterate.evaluate(&record(), &Environment::new()).unwrap().result);
    }

    #[test]
    fn test_empty_condition() {
        let empty = Condition::from_value(&json!({})).unwrap();
        assert!(empty.is_empty());
        let result = empty.evaluate(&record(), &Environment::new()).unwrap();
        assert_eq!(result.to_value(), json!({ "result": true }));

        let compound = Condition::all(vec![]);
        assert!(compound.evaluate(&record(), &Environment::new()).is_err());
        assert!(compound.evaluate_or_true(&record(), &Environment::new()).unwrap().result);
    }

    #[test]
    fn test_depth_and_context_sharing() {
        let context = Arc::new(EngineContext::default());
        let cond = Condition::all(vec![Condition::any(vec![Condition::simple("b.e", 2, Operator::Equal)])])
            .with_dependency(Condition::simple("b.g", "2", Operator::Equal))
            .with_context(context.clone());
        assert_eq!(cond.depth(), 3);
        assert!(Arc::ptr_eq(cond.conditions()[0].conditions()[0].context(), &context));
        assert!(Arc::ptr_eq(cond.dependencies()[0].context(), &context));

        cond.compile(false).unwrap();
        assert!(context.paths().contains("b.e"));
    }
}
