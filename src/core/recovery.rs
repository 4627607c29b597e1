//! 错误恢复引擎
//!
//! 根据控制器错误返回 RecoveryAction，供执行循环决定是带纠正提示重试，还是以已有观察停止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：解析错误重试，LLM 失败停止
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous decision was not valid JSON: {raw}. \
                Reply with exactly one JSON object and nothing else. \
                To call operations: {{\"calls\": [{{\"operation\": \"name\", \"arguments\": {{...}}}}]}}. \
                To finish: {{\"stop\": true}}."
            )),
            _ => RecoveryAction::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("{bad".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("{bad"));
            }
            _ => panic!("Expected RetryWithPrompt"),
        }
    }

    #[test]
    fn test_recovery_llm_error_stops() {
        let engine = RecoveryEngine::new();
        let err = AgentError::LlmError("connection reset".to_string());
        assert!(matches!(engine.handle(&err), RecoveryAction::Stop));
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(AgentError::DuplicateOperation("get_part".into()).is_fatal());
        assert!(AgentError::MissingCollaborator("fetcher").is_fatal());
        assert!(!AgentError::LlmError("x".into()).is_fatal());
    }
}
