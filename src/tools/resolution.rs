//! resolution 类操作：resolve_part / resolve_model

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{ErrorKind, OpError};
use crate::resolver::{IdentifierResolver, ResolutionOutcome};
use crate::tools::{Operation, OperationCategory, OperationContext};

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, OpError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OpError::invalid_input(format!("missing argument: {}", name)))
}

/// 多候选 → Ambiguous（候选随错误一起返回），其余结果原样作为 payload
fn outcome_to_result(outcome: ResolutionOutcome) -> Result<Value, OpError> {
    let payload = serde_json::to_value(&outcome).map_err(|e| OpError::invalid_input(e.to_string()))?;
    let many = outcome.candidates.as_ref().map(|c| c.len() > 1).unwrap_or(false);
    if !outcome.resolved && many {
        return Err(OpError::new(ErrorKind::Ambiguous, outcome.message).with_details(payload));
    }
    Ok(payload)
}

pub struct ResolvePartOp {
    resolver: Arc<IdentifierResolver>,
}

impl ResolvePartOp {
    pub fn new(resolver: Arc<IdentifierResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Operation for ResolvePartOp {
    fn name(&self) -> &str {
        "resolve_part"
    }

    fn description(&self) -> &str {
        "Turn a part reference (PS number, manufacturer number, product URL, \"this part\", or a description) into a PS number. Call this before lookups when the user did not give a PS number."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Resolution
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": { "type": "string", "description": "the user's reference to a part" },
                "use_session": { "type": "boolean", "description": "allow \"this part\" style references (default true)" }
            },
            "required": ["input"]
        })
    }

    async fn execute(&self, args: Value, ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let input = required_str(&args, "input")?;
        let use_session = args.get("use_session").and_then(Value::as_bool).unwrap_or(true);
        let session = if use_session { ctx.session } else { None };
        let outcome = self.resolver.resolve_part(input, session).await?;
        outcome_to_result(outcome)
    }
}

pub struct ResolveModelOp {
    resolver: Arc<IdentifierResolver>,
}

impl ResolveModelOp {
    pub fn new(resolver: Arc<IdentifierResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Operation for ResolveModelOp {
    fn name(&self) -> &str {
        "resolve_model"
    }

    fn description(&self) -> &str {
        "Validate an appliance model number, falling back to partial matches."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Resolution
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "input": { "type": "string", "description": "model number as typed by the user" } },
            "required": ["input"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let input = required_str(&args, "input")?;
        let outcome = self.resolver.resolve_model(input).await?;
        outcome_to_result(outcome)
    }
}
