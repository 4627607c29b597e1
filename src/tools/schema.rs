//! 决策 JSON Schema 生成（schemars）
//!
//! 将「合法决策」的 JSON 结构注入控制器 prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 一次操作调用（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct CallFormat {
    /// 操作名，如 resolve_part、get_part、search_qna
    pub operation: String,
    /// 操作参数，依操作不同而不同（ps_number、model_number、query 等）
    pub arguments: serde_json::Map<String, Value>,
}

/// 控制器决策：要么给出一组调用，要么 `{"stop": true}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct DecisionFormat {
    /// 本步要执行的调用（互不依赖的调用可合并为一批）
    pub calls: Option<Vec<CallFormat>>,
    /// 信息已足够时为 true
    pub stop: Option<bool>,
}

/// 返回决策的 JSON Schema 字符串，可拼入 system prompt
pub fn decision_schema_json() -> String {
    let schema = schema_for!(DecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_schema_mentions_fields() {
        let schema = decision_schema_json();
        assert!(schema.contains("calls"));
        assert!(schema.contains("operation"));
        assert!(schema.contains("stop"));
    }
}
