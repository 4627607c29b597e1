//! 控制器：根据查询、会话上下文与已有观察决定下一步调用哪些操作，或停止
//!
//! `parse_decision` 从 LLM 输出中提取 JSON（```json 代码块或首个 `{` 到最后一个 `}`）；
//! 没有 JSON 视为停止，JSON 非法交给恢复引擎重试。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::react::ToolCall;
use crate::session::Message;
use crate::tools::decision_schema_json;

/// 一次决策所需的全部输入
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub query: String,
    /// 会话焦点摘要（已引用配件、型号、症状）
    pub session_context: String,
    /// 最近的对话历史
    pub history: Vec<Message>,
    /// 已渲染的观察
    pub observations: Vec<String>,
    /// 按类别分组的操作文档
    pub documentation: String,
    pub step: usize,
    pub max_steps: usize,
    /// 上一次输出无法解析时的纠正提示
    pub correction: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// 调用一批操作（按顺序执行）
    Invoke(Vec<ToolCall>),
    Stop,
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, AgentError>;
}

/// 控制器输出的宽松形状：`calls` 列表、单个调用或 `stop`
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    calls: Option<Vec<ToolCall>>,
    #[serde(default, alias = "tool")]
    operation: Option<String>,
    #[serde(default, alias = "args")]
    arguments: Option<Value>,
    #[serde(default)]
    stop: Option<bool>,
}

fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let rest = &output[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end >= start).then(|| &output[start..=end])
}

/// 解析控制器输出
pub fn parse_decision(output: &str) -> Result<Decision, AgentError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Decision::Stop);
    };

    let raw: RawDecision = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if raw.stop == Some(true) {
        return Ok(Decision::Stop);
    }
    let mut calls = raw.calls.unwrap_or_default();
    if let Some(op) = raw.operation.filter(|o| !o.trim().is_empty()) {
        calls.push(ToolCall::new(op, raw.arguments.unwrap_or(Value::Object(Default::default()))));
    }
    calls.retain(|c| !c.operation.trim().is_empty());
    for call in &mut calls {
        if call.arguments.is_null() {
            call.arguments = Value::Object(Default::default());
        }
    }
    if calls.is_empty() {
        Ok(Decision::Stop)
    } else {
        Ok(Decision::Invoke(calls))
    }
}

const CONTROLLER_PROMPT: &str = "You are the planning controller of an assistant for refrigerator and dishwasher parts. \
You do not answer the user. You decide which catalog operations to call next, or stop when the observations are enough to answer.

Rules:
- Resolve identifiers before looking them up: use resolve_part for anything that is not an exact PS number, and resolve_model for model numbers.
- Never invent part numbers; only use identifiers from the query, the session context, or earlier observations.
- Do not repeat a call that already has an observation.
- fetch_part_live is slow; the system calls it automatically when a lookup reports not_found.
- Stop as soon as the observations answer the question, or when nothing more can be learned.";

/// 基于 LLM 的控制器
pub struct LlmController {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmController {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: CONTROLLER_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build_messages(&self, ctx: &DecisionContext) -> Vec<Message> {
        let system = format!(
            "{}\n\n# Operations\n{}\n\n# Output\nReply with one JSON object matching this schema and nothing else:\n{}\n\
Example: {{\"calls\": [{{\"operation\": \"get_part\", \"arguments\": {{\"ps_number\": \"PS11752778\"}}}}]}}\n\
To finish: {{\"stop\": true}}",
            self.system_prompt,
            ctx.documentation,
            decision_schema_json()
        );
        let mut messages = vec![Message::system(system)];
        messages.extend(ctx.history.iter().cloned());

        let mut turn = String::new();
        if !ctx.session_context.is_empty() {
            turn.push_str(&format!("Session context:\n{}\n\n", ctx.session_context));
        }
        turn.push_str(&format!("User query: {}\n\n", ctx.query));
        if ctx.observations.is_empty() {
            turn.push_str("Observations: none yet.\n");
        } else {
            turn.push_str("Observations so far:\n");
            for o in &ctx.observations {
                turn.push_str(o);
                turn.push('\n');
            }
        }
        turn.push_str(&format!("\nStep {} of {}.", ctx.step, ctx.max_steps));
        if let Some(correction) = &ctx.correction {
            turn.push_str(&format!("\n\n{}", correction));
        }
        messages.push(Message::user(turn));
        messages
    }
}

#[async_trait]
impl Controller for LlmController {
    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, AgentError> {
        let messages = self.build_messages(ctx);
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::LlmError)?;
        tracing::debug!(step = ctx.step, output = %crate::observability::preview(&output, 200), "controller output");
        parse_decision(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_calls_and_single_shapes() {
        let d = parse_decision(
            "```json\n{\"calls\": [{\"operation\": \"get_part\", \"arguments\": {\"ps_number\": \"PS1\"}}, {\"operation\": \"get_symptoms\"}]}\n```",
        )
        .unwrap();
        match d {
            Decision::Invoke(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].arg_str("ps_number"), Some("PS1"));
                assert!(calls[1].arguments.is_object());
            }
            other => panic!("unexpected {:?}", other),
        }

        let single = parse_decision("I'll look it up: {\"tool\": \"resolve_part\", \"args\": {\"input\": \"ice maker\"}}").unwrap();
        assert_eq!(
            single,
            Decision::Invoke(vec![ToolCall::new("resolve_part", serde_json::json!({"input": "ice maker"}))])
        );
    }

    #[test]
    fn test_parse_stop_forms() {
        assert_eq!(parse_decision("{\"stop\": true}").unwrap(), Decision::Stop);
        assert_eq!(parse_decision("The observations are sufficient.").unwrap(), Decision::Stop);
        assert_eq!(parse_decision("{\"calls\": []}").unwrap(), Decision::Stop);
    }

    #[test]
    fn test_parse_malformed_json_is_error() {
        assert!(matches!(
            parse_decision("{\"calls\": [ {\"operation\": }"),
            Err(AgentError::JsonParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_controller_includes_observations_and_correction() {
        let llm = Arc::new(MockLlmClient::with_responses(vec!["{\"stop\": true}".to_string()]));
        let controller = LlmController::new(llm.clone());
        let ctx = DecisionContext {
            query: "Is PS1 in stock?".into(),
            observations: vec!["[1] get_part({}) -> {...}".into()],
            correction: Some("Reply with JSON".into()),
            step: 2,
            max_steps: 8,
            ..Default::default()
        };
        let messages = controller.build_messages(&ctx);
        let last = &messages.last().unwrap().content;
        assert!(last.contains("[1] get_part"));
        assert!(last.contains("Reply with JSON"));
        assert!(last.contains("Step 2 of 8"));
        assert_eq!(controller.decide(&ctx).await.unwrap(), Decision::Stop);
        assert_eq!(llm.call_count(), 1);
    }
}
