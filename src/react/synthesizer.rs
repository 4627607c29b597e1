//! 回复生成：把观察集合交给文本生成能力，失败或无可用数据时降级为诚实的「未能查到」说明
//!
//! 另提供回复后处理：提取回复中提到的配件号、从观察中整理配件卡片。

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::react::Observation;
use crate::session::{EntityKey, Message};

const OBSERVATION_CHARS: usize = 3000;

/// 文本生成的输入
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub query: String,
    pub session_context: String,
    pub history: Vec<Message>,
    /// 已渲染的观察
    pub observations: Vec<String>,
    /// 回复中可以引用的全部配件号
    pub entity_keys: Vec<EntityKey>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AgentError>;
}

const SYNTHESIZER_PROMPT: &str = "You are a friendly assistant for an appliance parts retailer, helping with refrigerator and dishwasher parts only. \
Answer the user's question using only the observations below. Never invent part numbers, prices, stock status or compatibility. \
If the observations do not contain the answer, say so plainly. Mention part numbers (PS...) exactly as written when you refer to a part. \
Keep the answer concise and use short bullet lists for multiple parts.";

pub struct LlmTextGenerator {
    llm: Arc<dyn LlmClient>,
}

impl LlmTextGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TextGenerator for LlmTextGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AgentError> {
        let mut system = String::from(SYNTHESIZER_PROMPT);
        if !request.session_context.is_empty() {
            system.push_str(&format!("\n\nSession context:\n{}", request.session_context));
        }
        let mut messages = vec![Message::system(system)];
        messages.extend(request.history.iter().cloned());

        let mut turn = format!("Question: {}\n\nObservations:\n", request.query);
        for o in &request.observations {
            turn.push_str(&crate::observability::preview(o, OBSERVATION_CHARS));
            turn.push('\n');
        }
        if !request.entity_keys.is_empty() {
            let keys: Vec<&str> = request.entity_keys.iter().map(EntityKey::as_str).collect();
            turn.push_str(&format!("\nPart numbers you may reference: {}", keys.join(", ")));
        }
        messages.push(Message::user(turn));

        let text = self.llm.complete(&messages).await.map_err(AgentError::LlmError)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::LlmError("empty response".to_string()));
        }
        Ok(text.to_string())
    }
}

fn mention_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bPS\d+\b").expect("static regex"))
}

/// 回复中提到的配件号
pub fn extract_mentioned_keys(text: &str) -> HashSet<EntityKey> {
    mention_shape()
        .find_iter(text)
        .filter_map(|m| EntityKey::parse(m.as_str()))
        .collect()
}

/// 观察调用参数中出现过的配件号 / 查询输入，按出现顺序
fn attempted_identifiers(observations: &[Observation]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for o in observations {
        for arg in ["ps_number", "input", "model_number", "part_number"] {
            if let Some(v) = o.call.arg_str(arg) {
                if seen.insert(v.to_uppercase()) {
                    out.push(v.to_string());
                }
            }
        }
    }
    out
}

/// 没有可用数据时的回复：点名尝试过的标识，不给出任何未经核实的信息
pub fn honest_fallback_response(observations: &[Observation]) -> String {
    let ids = attempted_identifiers(observations);
    if ids.is_empty() {
        return "I'm sorry, I couldn't find or verify the information you asked about. \
Could you share the part number (it starts with PS) or your appliance's model number?"
            .to_string();
    }
    format!(
        "I'm sorry, I couldn't find or verify information for {}. \
Please double-check the number, or share your appliance's model number and I'll try again.",
        ids.join(", ")
    )
}

/// 回复附带的配件卡片
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartCard {
    pub ps_number: EntityKey,
    pub part_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appliance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
}

fn card_from(value: &Value) -> Option<PartCard> {
    let ps_number = EntityKey::parse(value.get("ps_number")?.as_str()?)?;
    let part_name = value.get("part_name")?.as_str()?.trim();
    if part_name.is_empty() {
        return None;
    }
    let text = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);
    Some(PartCard {
        ps_number,
        part_name: part_name.to_string(),
        part_price: value.get("part_price").and_then(Value::as_f64),
        average_rating: value.get("average_rating").and_then(Value::as_f64),
        availability: text("availability"),
        appliance_type: text("appliance_type"),
        product_url: text("product_url"),
    })
}

fn collect_cards(value: &Value, out: &mut Vec<PartCard>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_cards(v, out)),
        Value::Object(map) => {
            if let Some(card) = card_from(value) {
                out.push(card);
            }
            if let Some(parts @ Value::Array(_)) = map.get("parts") {
                collect_cards(parts, out);
            }
        }
        _ => {}
    }
}

/// 从成功的观察中整理配件卡片，只保留回复中提到的配件，每个配件一张
pub fn part_cards(observations: &[Observation], mentioned: &HashSet<EntityKey>) -> Vec<PartCard> {
    let mut all = Vec::new();
    for o in observations.iter().filter(|o| !o.result.is_error()) {
        collect_cards(&o.result.payload, &mut all);
    }
    let mut seen = HashSet::new();
    all.into_iter()
        .filter(|c| mentioned.contains(&c.ps_number) && seen.insert(c.ps_number.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OpError;
    use crate::llm::MockLlmClient;
    use crate::react::{ToolCall, ToolResult};
    use serde_json::json;

    fn obs(op: &str, args: Value, result: ToolResult) -> Observation {
        Observation {
            step: 1,
            call: ToolCall::new(op, args),
            result,
        }
    }

    #[test]
    fn test_extract_mentioned_keys() {
        let keys = extract_mentioned_keys("Try PS11752778 or ps3406971; not XPS12 or PS.");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&EntityKey::parse("PS3406971").unwrap()));
    }

    #[test]
    fn test_honest_response_names_identifiers() {
        let failed = obs(
            "get_part",
            json!({"ps_number": "PS404"}),
            ToolResult::failed("get_part", OpError::not_found("part PS404 not found")),
        );
        let text = honest_fallback_response(&[failed]);
        assert!(text.contains("PS404"));
        assert!(text.contains("couldn't find or verify"));
        assert!(honest_fallback_response(&[]).contains("starts with PS"));
    }

    #[test]
    fn test_part_cards_filtered_to_mentioned() {
        let search = obs(
            "search_parts",
            json!({"query": "bin"}),
            ToolResult::ok(
                "search_parts",
                json!([
                    {"ps_number": "PS1", "part_name": "Door Bin", "part_price": 44.95},
                    {"ps_number": "PS2", "part_name": "Shelf"}
                ]),
            ),
        );
        let again = obs(
            "get_part",
            json!({"ps_number": "PS1"}),
            ToolResult::ok("get_part", json!({"ps_number": "PS1", "part_name": "Door Bin"})),
        );
        let mentioned = extract_mentioned_keys("PS1 is the bin you want.");
        let cards = part_cards(&[search, again], &mentioned);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].part_price, Some(44.95));
    }

    #[tokio::test]
    async fn test_llm_generator_passes_keys_and_rejects_empty() {
        let llm = Arc::new(MockLlmClient::with_responses(vec!["PS1 fits.".to_string(), "   ".to_string()]));
        let generator = LlmTextGenerator::new(llm);
        let request = GenerationRequest {
            query: "does it fit".into(),
            observations: vec!["[1] get_part(...)".into()],
            entity_keys: vec![EntityKey::parse("PS1").unwrap()],
            ..Default::default()
        };
        assert_eq!(generator.generate(&request).await.unwrap(), "PS1 fits.");
        assert!(generator.generate(&request).await.is_err());
    }
}
