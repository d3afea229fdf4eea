//! 条件存储管理
//!
//! 使用 DashMap 提供线程安全的条件注册表，按名称保存已编译的条件，
//! 支持加载、热替换、删除和批量操作。不负责持久化。

use crate::condition::Condition;
use crate::context::EngineContext;
use crate::error::{Result, RuleError};
use crate::models::{ConditionDef, Environment, EvaluationResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 条件存储
#[derive(Clone)]
pub struct ConditionStore {
    /// 已编译的条件
    conditions: Arc<DashMap<String, Arc<Condition>>>,
    /// 新加载的条件共享的上下文
    context: Arc<EngineContext>,
}

impl ConditionStore {
    pub fn new() -> Self {
        Self::with_context(Arc::new(EngineContext::default()))
    }

    pub fn with_context(context: Arc<EngineContext>) -> Self {
        Self {
            conditions: Arc::new(DashMap::new()),
            context,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 加载条件（从纯数据形式）
    #[instrument(skip(self, def))]
    pub fn load(&self, id: &str, def: &ConditionDef) -> Result<()> {
        let condition = Condition::from_def_with_context(def, self.context.clone())?;
        self.insert(id, condition)
    }

    /// 加载已构建的条件，条件会切换到存储的上下文
    #[instrument(skip(self, condition))]
    pub fn load_condition(&self, id: &str, condition: Condition) -> Result<()> {
        self.insert(id, condition.with_context(self.context.clone()))
    }

    /// 加载条件（从 JSON 字符串）
    #[instrument(skip(self, json))]
    pub fn load_from_json(&self, id: &str, json: &str) -> Result<()> {
        let def = ConditionDef::from_json(json)?;
        self.load(id, &def)
    }

    /// 热替换已存在的条件
    #[instrument(skip(self, def))]
    pub fn replace(&self, id: &str, def: &ConditionDef) -> Result<()> {
        if !self.conditions.contains_key(id) {
            warn!("替换不存在的条件: {}", id);
            return Err(RuleError::ConditionNotFound(id.to_string()));
        }
        self.load(id, def)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> Result<()> {
        if self.conditions.remove(id).is_some() {
            info!("条件已删除: {}", id);
            Ok(())
        } else {
            warn!("删除不存在的条件: {}", id);
            Err(RuleError::ConditionNotFound(id.to_string()))
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Condition>> {
        self.conditions.get(id).map(|c| c.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conditions.contains_key(id)
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.key().clone()).collect()
    }

    /// 批量加载，单条失败不影响其余条件
    #[instrument(skip(self, defs))]
    pub fn load_batch(&self, defs: Vec<(String, ConditionDef)>) -> Vec<String> {
        let mut loaded_ids = Vec::with_capacity(defs.len());
        let mut errors = Vec::new();

        for (id, def) in defs {
            match self.load(&id, &def) {
                Ok(()) => loaded_ids.push(id),
                Err(e) => errors.push((id, e)),
            }
        }

        if !errors.is_empty() {
            warn!("批量加载部分失败: {:?}", errors);
        }

        info!("批量加载完成: {} 成功, {} 失败", loaded_ids.len(), errors.len());
        loaded_ids
    }

    #[instrument(skip(self))]
    pub fn clear(&self) {
        let count = self.conditions.len();
        self.conditions.clear();
        info!("已清空 {} 条条件", count);
    }

    /// 按名称求值
    pub fn evaluate(&self, id: &str, record: &Value, environment: &Environment) -> Result<EvaluationResult> {
        let condition = self.get(id).ok_or_else(|| {
            warn!("求值不存在的条件: {}", id);
            RuleError::ConditionNotFound(id.to_string())
        })?;
        condition.evaluate(record, environment)
    }

    /// 编译成功后才放入存储，已有的同名条件被替换
    fn insert(&self, id: &str, condition: Condition) -> Result<()> {
        condition.compile(false)?;
        self.conditions.insert(id.to_string(), Arc::new(condition));
        info!("条件已加载: {}", id);
        Ok(())
    }
}

impl Default for ConditionStore {
    fn default() -> Self {
        Self::new()
    }
}
