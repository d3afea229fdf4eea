//! 引擎指标
//!
//! 引擎只通过 metrics 门面记录计数器，这里统一登记指标描述。
//! 是否导出、导出到哪里由宿主安装的 recorder 决定。

/// 条件编译次数，`cache` 标签取 hit、miss 或 forced
pub const CONDITION_COMPILATIONS_TOTAL: &str = "condition_compilations_total";
/// 顶层条件求值次数
pub const CONDITION_EVALUATIONS_TOTAL: &str = "condition_evaluations_total";
/// 路径查询编译次数
pub const PATH_QUERY_COMPILATIONS_TOTAL: &str = "path_query_compilations_total";

/// 登记指标描述
pub fn describe_engine_metrics() {
    metrics::describe_counter!(
        CONDITION_COMPILATIONS_TOTAL,
        "Total number of condition compilations by cache outcome"
    );
    metrics::describe_counter!(
        CONDITION_EVALUATIONS_TOTAL,
        "Total number of top-level condition evaluations"
    );
    metrics::describe_counter!(
        PATH_QUERY_COMPILATIONS_TOTAL,
        "Total number of compiled path queries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_without_recorder() {
        // 未安装 recorder 时登记描述是空操作
        describe_engine_metrics();
        describe_engine_metrics();
    }
}
