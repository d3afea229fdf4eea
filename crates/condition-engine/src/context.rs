//! 引擎上下文
//!
//! 条件树编译时共享的作用域状态：路径查询缓存、正则缓存和默认区域设置。

use crate::operators::PatternCache;
use crate::path::PathCache;
use condition_shared::config::EngineConfig;

pub const DEFAULT_LOCALE: &str = "en-US";

#[derive(Debug)]
pub struct EngineContext {
    paths: PathCache,
    patterns: PatternCache,
    locale: String,
}

impl EngineContext {
    pub fn new() -> Self {
        Self {
            paths: PathCache::new(),
            patterns: PatternCache::new(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let (paths, patterns) = match config.path_cache_capacity {
            Some(capacity) => (PathCache::bounded(capacity), PatternCache::bounded(capacity)),
            None => (PathCache::new(), PatternCache::new()),
        };
        Self {
            paths,
            patterns,
            locale: config.default_locale.clone(),
        }
    }

    pub fn with_path_cache(mut self, paths: PathCache) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn paths(&self) -> &PathCache {
        &self.paths
    }

    pub fn patterns(&self) -> &PatternCache {
        &self.patterns
    }

    /// STRING 变换未指定区域时使用
    pub fn locale(&self) -> &str {
        &self.locale
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}
