//! 共享库
//!
//! 条件引擎宿主共用的配置加载和可观测性初始化。

pub mod config;
pub mod observability;
