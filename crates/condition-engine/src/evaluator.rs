//! 编译后的条件评估函数

use crate::error::Result;
use crate::models::{Environment, EvaluationResult};
use condition_shared::observability::metrics::CONDITION_EVALUATIONS_TOTAL;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

type EvalFn = dyn Fn(&Value, &Environment) -> Result<EvaluationResult> + Send + Sync;

/// 条件编译的产物
///
/// 纯函数 `(record, environment) -> EvaluationResult`，克隆只增加引用计数。
/// 同一条件在结构未变时重复编译会得到同一个实例，可用 [`Evaluator::ptr_eq`] 判断。
#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<EvalFn>,
}

impl Evaluator {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &Environment) -> Result<EvaluationResult> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// 对记录求值
    pub fn evaluate(&self, record: &Value, environment: &Environment) -> Result<EvaluationResult> {
        metrics::counter!(CONDITION_EVALUATIONS_TOTAL).increment(1);
        let result = self.call(record, environment)?;
        trace!(result = result.result, "条件求值完成");
        Ok(result)
    }

    /// 使用空环境求值
    pub fn evaluate_record(&self, record: &Value) -> Result<EvaluationResult> {
        self.evaluate(record, &Environment::new())
    }

    /// 子条件调用，不计入评估次数
    pub(crate) fn call(&self, record: &Value, environment: &Environment) -> Result<EvaluationResult> {
        (self.inner)(record, environment)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}
