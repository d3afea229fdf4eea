//! 条件引擎
//!
//! 将声明式的条件树编译为可执行的评估函数，评估结果附带完整的决策追踪：
//! - JSON 条件定义、取值来源推断和校验
//! - 取值后的变换流水线
//! - 按结构哈希缓存的编译结果
//! - 线程安全的条件存储

pub mod coerce;
pub mod condition;
mod compiler;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod models;
pub mod mutations;
pub mod operators;
pub mod path;
pub mod source;
pub mod store;
pub mod temporal;

pub use condition::{Condition, ConditionTest};
pub use context::EngineContext;
pub use error::{Result, RuleError};
pub use evaluator::Evaluator;
pub use models::{ConditionDef, ConditionType, Environment, EvaluationResult};
pub use mutations::{apply_mutations, Mutation, MutationStep};
pub use operators::{Operator, PatternCache};
pub use path::{PathCache, PathQuery};
pub use source::{Source, SourceKind};
pub use store::ConditionStore;
pub use temporal::RelativeDate;
