//! 调用与观察：ToolCall / ToolResult / Observation，以及从结果中提取配件实体
//!
//! 实体提取覆盖：单个配件对象、配件列表、`parts` / `candidates` 嵌套列表、
//! 解析成功的 resolution 结果、`{part_number, models}` 形状（适配型号列表）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ErrorKind, OpError};
use crate::session::EntityKey;

/// 控制器给出的一次操作调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "tool")]
    pub operation: String,
    #[serde(default, alias = "args")]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(operation: impl Into<String>, arguments: Value) -> Self {
        Self {
            operation: operation.into(),
            arguments,
        }
    }

    /// 去重用的身份：操作名 + 规范化参数（serde_json 的 Map 键有序）
    pub fn identity(&self) -> String {
        format!("{}:{}", self.operation, self.arguments)
    }

    /// 取字符串参数（去首尾空白，空串视为缺失）
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.arguments
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// 正常执行
    Operation,
    /// 回退编排器自动触发的实时抓取
    Fallback,
    /// 由实时抓取结果（本轮或会话缓存）回答
    LiveCache,
    /// 本轮相同调用的复用结果
    Deduplicated,
}

/// 操作结果：payload + 顶层类别 + 可选错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub operation: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OpError>,
    pub source: ResultSource,
}

impl ToolResult {
    pub fn ok(operation: impl Into<String>, payload: Value) -> Self {
        let category = payload
            .get("appliance_type")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);
        Self {
            operation: operation.into(),
            payload,
            category,
            error: None,
            source: ResultSource::Operation,
        }
    }

    pub fn failed(operation: impl Into<String>, error: OpError) -> Self {
        Self {
            operation: operation.into(),
            payload: error.details.clone().unwrap_or(Value::Null),
            category: None,
            error: Some(error),
            source: ResultSource::Operation,
        }
    }

    pub fn with_source(mut self, source: ResultSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// 执行循环中的一条观察
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step: usize,
    pub call: ToolCall,
    pub result: ToolResult,
}

impl Observation {
    /// 给控制器 / 回复生成看的紧凑文本
    pub fn render(&self, max_chars: usize) -> String {
        let body = match &self.result.error {
            Some(err) => format!("ERROR {}", err),
            None => self.result.payload.to_string(),
        };
        format!(
            "[{}] {}({}) -> {}",
            self.step,
            self.result.operation,
            self.call.arguments,
            crate::observability::preview(&body, max_chars)
        )
    }
}

/// 结果中出现的一个配件实体
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRef {
    pub key: EntityKey,
    /// 声明的类别（可能不在允许集合内）；None 表示缺失
    pub category: Option<String>,
    pub name: Option<String>,
    /// 上游显式标记越界
    pub out_of_scope: bool,
    /// 推断类别用的描述文本
    pub description: String,
}

const DESCRIPTION_CHARS: usize = 500;

/// 递归提取 payload 中的配件实体（按出现顺序，不去重）
pub fn extract_entities(payload: &Value) -> Vec<EntityRef> {
    let mut out = Vec::new();
    walk(payload, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<EntityRef>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
        Value::Object(map) => {
            if let Some(entity) = entity_from_object(value) {
                out.push(entity);
            }
            for nested in ["parts", "candidates"] {
                if let Some(v @ Value::Array(_)) = map.get(nested) {
                    walk(v, out);
                }
            }
        }
        _ => {}
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn entity_from_object(obj: &Value) -> Option<EntityRef> {
    // 解析结果：resolved=true 且 kind=part
    if obj.get("resolved").and_then(Value::as_bool) == Some(true) {
        if str_field(obj, "kind") != Some("part") {
            return None;
        }
        let key = EntityKey::parse(str_field(obj, "key")?)?;
        return Some(EntityRef {
            key,
            category: str_field(obj, "category").map(str::to_string),
            name: str_field(obj, "name").map(str::to_string),
            out_of_scope: false,
            description: str_field(obj, "name").unwrap_or_default().to_string(),
        });
    }

    // 适配型号：{part_number, models}，类别取第一个型号的 appliance_type
    if let (Some(ps), Some(Value::Array(models))) = (str_field(obj, "part_number"), obj.get("models")) {
        let key = EntityKey::parse(ps)?;
        let category = models
            .iter()
            .find_map(|m| str_field(m, "appliance_type"))
            .map(str::to_string);
        let description = models
            .iter()
            .filter_map(|m| str_field(m, "description"))
            .take(5)
            .collect::<Vec<_>>()
            .join(", ");
        return Some(EntityRef {
            key,
            category,
            name: None,
            out_of_scope: false,
            description,
        });
    }

    // 配件对象：ps_number + (part_name | appliance_type | out_of_scope)
    let key = EntityKey::parse(str_field(obj, "ps_number")?)?;
    let marked = obj.get("out_of_scope").and_then(Value::as_bool).unwrap_or(false);
    if obj.get("part_name").is_none() && obj.get("appliance_type").is_none() && !marked {
        return None;
    }
    Some(EntityRef {
        key,
        category: str_field(obj, "appliance_type").map(str::to_string),
        name: str_field(obj, "part_name").map(str::to_string),
        out_of_scope: marked,
        description: describe_part(obj),
    })
}

/// 名称、厂商、描述、适配型号、评价与问答样本拼成的描述文本
fn describe_part(obj: &Value) -> String {
    let mut lines = Vec::new();
    if let Some(name) = str_field(obj, "part_name") {
        lines.push(format!("Part Name: {}", name));
    }
    if let Some(m) = str_field(obj, "part_manufacturer") {
        lines.push(format!("Manufacturer: {}", m));
    }
    if let Some(d) = str_field(obj, "part_description") {
        lines.push(format!(
            "Description: {}",
            d.chars().take(DESCRIPTION_CHARS).collect::<String>()
        ));
    }
    let sample = |field: &str, n: usize, render: &dyn Fn(&Value) -> Option<String>| -> Vec<String> {
        obj.get(field)
            .and_then(Value::as_array)
            .map(|items| items.iter().take(n).filter_map(render).collect())
            .unwrap_or_default()
    };
    let models = sample("compatible_models", 5, &|m| str_field(m, "description").map(str::to_string));
    if !models.is_empty() {
        lines.push(format!("Compatible Models: {}", models.join(", ")));
    }
    let reviews = sample("reviews", 3, &|r| {
        str_field(r, "review_text").map(|t| t.chars().take(200).collect())
    });
    if !reviews.is_empty() {
        lines.push(format!("Sample Reviews: {}", reviews.join(" | ")));
    }
    let qna = sample("qna", 3, &|q| {
        Some(
            format!(
                "Q: {} A: {}",
                str_field(q, "question").unwrap_or_default(),
                str_field(q, "answer").unwrap_or_default()
            )
            .chars()
            .take(150)
            .collect(),
        )
    });
    if !qna.is_empty() {
        lines.push(format!("Sample Q&A: {}", qna.join(" | ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_aliases_and_identity() {
        let call: ToolCall =
            serde_json::from_str(r#"{"tool": "get_part", "args": {"ps_number": "PS1"}}"#).unwrap();
        assert_eq!(call.operation, "get_part");
        assert_eq!(call.arg_str("ps_number"), Some("PS1"));
        let same = ToolCall::new("get_part", json!({"ps_number": "PS1"}));
        assert_eq!(call.identity(), same.identity());
    }

    #[test]
    fn test_extract_single_part_and_list() {
        let part = json!({"ps_number": "PS11752778", "part_name": "Bin", "appliance_type": "refrigerator"});
        let found = extract_entities(&part);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category.as_deref(), Some("refrigerator"));

        let list = json!([part, {"ps_number": "PS2", "part_name": "Tray", "appliance_type": ""}]);
        let found = extract_entities(&list);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].category, None);
    }

    #[test]
    fn test_extract_nested_and_special_shapes() {
        let resolution = json!({
            "resolved": true, "kind": "part", "key": "PS5", "category": "dishwasher", "name": "Rack"
        });
        assert_eq!(extract_entities(&resolution)[0].key.as_str(), "PS5");

        let unresolved = json!({
            "resolved": false, "kind": "part",
            "candidates": [{"ps_number": "PS7", "part_name": "Pump", "appliance_type": "dishwasher"}]
        });
        assert_eq!(extract_entities(&unresolved)[0].key.as_str(), "PS7");

        let models = json!({
            "part_number": "PS8", "compatible_model_count": 1,
            "models": [{"model_number": "M1", "appliance_type": "microwave", "description": "Over-the-range"}]
        });
        let found = extract_entities(&models);
        assert_eq!(found[0].category.as_deref(), Some("microwave"));
        assert_eq!(found[0].description, "Over-the-range");

        let flagged = json!({"ps_number": "PS9", "out_of_scope": true, "appliance_type": "chainsaw"});
        assert!(extract_entities(&flagged)[0].out_of_scope);

        assert!(extract_entities(&json!({"ps_number": "PS1"})).is_empty());
        assert!(extract_entities(&json!({"compatible": true})).is_empty());
    }

    #[test]
    fn test_description_uses_live_subcollections() {
        let live = json!({
            "ps_number": "PS3", "part_name": "Bar Chain",
            "reviews": [{"review_text": "Cuts firewood well"}],
            "qna": [{"question": "Fits 18 inch bar?", "answer": "Yes"}]
        });
        let d = &extract_entities(&live)[0].description;
        assert!(d.contains("Bar Chain"));
        assert!(d.contains("firewood"));
        assert!(d.contains("Q: Fits 18 inch bar? A: Yes"));
    }
}
