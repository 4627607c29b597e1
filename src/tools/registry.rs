//! 操作注册表
//!
//! 所有数据操作实现 Operation trait（name / description / category / execute），
//! 由 OperationRegistry 按名注册与查找。注册表在启动时由 `bootstrap_registry` 一次性构建，
//! 以 `Arc` 传给执行器与控制器；重名注册返回 `AgentError::DuplicateOperation`。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::{AgentError, OpError};
use crate::session::Session;

/// 操作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationCategory {
    Resolution,
    Lookup,
    Search,
    Fallback,
}

impl OperationCategory {
    pub const ORDER: [OperationCategory; 4] = [
        OperationCategory::Resolution,
        OperationCategory::Lookup,
        OperationCategory::Search,
        OperationCategory::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Resolution => "resolution",
            OperationCategory::Lookup => "lookup",
            OperationCategory::Search => "search",
            OperationCategory::Fallback => "fallback",
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行时可读的上下文（只读会话快照）
#[derive(Clone, Copy, Default)]
pub struct OperationContext<'a> {
    pub session: Option<&'a Session>,
}

impl<'a> OperationContext<'a> {
    pub fn with_session(session: &'a Session) -> Self {
        Self {
            session: Some(session),
        }
    }
}

/// 操作 trait：名称、描述（供控制器理解）、类别、参数 schema、异步执行
#[async_trait]
pub trait Operation: Send + Sync {
    /// 操作名称（对应决策 JSON 中的 "operation" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> OperationCategory;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 携带配件号的参数名；lookup 操作返回 NotFound 时据此触发回退
    fn identifier_arg(&self) -> Option<&str> {
        None
    }

    /// 用实时抓取结果（含嵌套子集合）直接回答本次调用；不支持时返回 None
    fn answer_from_live(&self, _live: &Value, _args: &Value) -> Option<Value> {
        None
    }

    async fn execute(&self, args: Value, ctx: &OperationContext<'_>) -> Result<Value, OpError>;
}

/// 对外公开的操作元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetadata {
    pub name: String,
    pub category: OperationCategory,
    pub description: String,
    pub parameters: Value,
}

/// 操作注册表：名称有序，重名即配置错误
#[derive(Default)]
pub struct OperationRegistry {
    operations: BTreeMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: impl Operation + 'static) -> Result<(), AgentError> {
        self.add_arc(Arc::new(op))
    }

    pub fn add_arc(&mut self, op: Arc<dyn Operation>) -> Result<(), AgentError> {
        let name = op.name().to_string();
        if self.operations.contains_key(&name) {
            return Err(AgentError::DuplicateOperation(name));
        }
        self.operations.insert(name, op);
        Ok(())
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    pub fn list_all(&self) -> Vec<OperationMetadata> {
        self.operations
            .values()
            .map(|op| OperationMetadata {
                name: op.name().to_string(),
                category: op.category(),
                description: op.description().to_string(),
                parameters: op.parameters_schema(),
            })
            .collect()
    }

    /// 类别为 fallback 的第一个操作（按名称序）
    pub fn fallback_operation(&self) -> Option<Arc<dyn Operation>> {
        self.operations
            .values()
            .find(|op| op.category() == OperationCategory::Fallback)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 按类别分组的操作文档，写入控制器 prompt
    pub fn render_documentation(&self) -> String {
        let mut out = String::new();
        for category in OperationCategory::ORDER {
            let ops: Vec<&Arc<dyn Operation>> = self
                .operations
                .values()
                .filter(|op| op.category() == category)
                .collect();
            if ops.is_empty() {
                continue;
            }
            out.push_str(&format!("## {} operations\n", category));
            for op in ops {
                out.push_str(&format!(
                    "- {}: {}\n  parameters: {}\n",
                    op.name(),
                    op.description(),
                    op.parameters_schema()
                ));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Stub {
        name: &'static str,
        category: OperationCategory,
    }

    #[async_trait]
    impl Operation for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "stub operation"
        }
        fn category(&self) -> OperationCategory {
            self.category
        }
        async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
            Ok(json!({ "echo": args }))
        }
    }

    fn stub(name: &'static str, category: OperationCategory) -> Stub {
        Stub { name, category }
    }

    #[test]
    fn test_duplicate_name_is_config_error() {
        let mut registry = OperationRegistry::new();
        registry.add(stub("get_part", OperationCategory::Lookup)).unwrap();
        let err = registry
            .add(stub("get_part", OperationCategory::Search))
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateOperation(ref n) if n == "get_part"));
        assert!(err.is_fatal());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registration_order_independent() {
        let mut a = OperationRegistry::new();
        a.add(stub("search_parts", OperationCategory::Search)).unwrap();
        a.add(stub("get_part", OperationCategory::Lookup)).unwrap();
        let mut b = OperationRegistry::new();
        b.add(stub("get_part", OperationCategory::Lookup)).unwrap();
        b.add(stub("search_parts", OperationCategory::Search)).unwrap();
        assert_eq!(a.list_all(), b.list_all());
        assert_eq!(a.render_documentation(), b.render_documentation());
    }

    #[test]
    fn test_documentation_grouped_by_category() {
        let mut registry = OperationRegistry::new();
        registry.add(stub("fetch_part_live", OperationCategory::Fallback)).unwrap();
        registry.add(stub("get_part", OperationCategory::Lookup)).unwrap();
        registry.add(stub("resolve_part", OperationCategory::Resolution)).unwrap();
        let doc = registry.render_documentation();
        let resolution = doc.find("## resolution").unwrap();
        let lookup = doc.find("## lookup").unwrap();
        let fallback = doc.find("## fallback").unwrap();
        assert!(resolution < lookup && lookup < fallback);
        assert!(!doc.contains("## search"));
        assert!(doc.contains("- get_part: stub operation"));
        assert_eq!(
            registry.fallback_operation().map(|op| op.name().to_string()),
            Some("fetch_part_live".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_handler_executes() {
        let mut registry = OperationRegistry::new();
        registry.add(stub("get_part", OperationCategory::Lookup)).unwrap();
        let op = registry.get_handler("get_part").unwrap();
        let out = op
            .execute(json!({"ps_number": "PS1"}), &OperationContext::default())
            .await
            .unwrap();
        assert_eq!(out["echo"]["ps_number"], "PS1");
        assert!(registry.get_handler("missing").is_none());
    }
}
