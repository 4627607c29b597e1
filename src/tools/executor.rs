//! 操作执行器
//!
//! 持有 OperationRegistry 与两档超时（普通 lookup / 回退抓取），execute(call) 在超时内调用对应操作，
//! 所有失败都折叠为 `ToolResult.error`，从不返回 Err；`UpstreamUnavailable` 在调用点退避后重试一次。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{ErrorKind, OpError};
use crate::react::{ToolCall, ToolResult};
use crate::tools::{Operation, OperationCategory, OperationContext, OperationRegistry};

/// 操作执行器：对每次调用施加超时，并将结果映射为 ToolResult
pub struct OperationExecutor {
    registry: Arc<OperationRegistry>,
    lookup_timeout: Duration,
    fallback_timeout: Duration,
    retry_backoff: Duration,
}

impl OperationExecutor {
    pub fn new(registry: Arc<OperationRegistry>, lookup_timeout: Duration, fallback_timeout: Duration) -> Self {
        Self {
            registry,
            lookup_timeout,
            fallback_timeout,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// 执行一次调用；未知操作为 InvalidInput，超时为 Timeout，上游不可达时退避重试一次
    pub async fn execute(&self, call: &ToolCall, ctx: &OperationContext<'_>) -> ToolResult {
        let Some(op) = self.registry.get_handler(&call.operation) else {
            let err = OpError::invalid_input(format!("Unknown operation: {}", call.operation));
            audit(&call.operation, &call.arguments, Err(&err), Duration::ZERO);
            return ToolResult::failed(&call.operation, err);
        };

        let mut result = self.execute_once(op.as_ref(), call, ctx).await;
        let retryable = op.category() != OperationCategory::Fallback
            && matches!(&result, Err(e) if e.kind == ErrorKind::UpstreamUnavailable);
        if retryable {
            tracing::warn!(operation = %call.operation, "upstream unavailable, retrying once");
            tokio::time::sleep(self.retry_backoff).await;
            result = self.execute_once(op.as_ref(), call, ctx).await;
        }

        match result {
            Ok(payload) => ToolResult::ok(&call.operation, payload),
            Err(err) => ToolResult::failed(&call.operation, err),
        }
    }

    async fn execute_once(
        &self,
        op: &dyn Operation,
        call: &ToolCall,
        ctx: &OperationContext<'_>,
    ) -> Result<Value, OpError> {
        let limit = match op.category() {
            OperationCategory::Fallback => self.fallback_timeout,
            _ => self.lookup_timeout,
        };
        let start = Instant::now();
        let result = match timeout(limit, op.execute(call.arguments.clone(), ctx)).await {
            Ok(r) => r,
            Err(_) => Err(OpError::new(
                ErrorKind::Timeout,
                format!("{} exceeded {}s", call.operation, limit.as_secs_f32()),
            )),
        };
        audit(&call.operation, &call.arguments, result.as_ref(), start.elapsed());
        result
    }
}

fn audit(operation: &str, args: &Value, result: Result<&Value, &OpError>, elapsed: Duration) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok"),
        Err(e) => (false, e.kind.as_str()),
    };
    let audit = serde_json::json!({
        "event": "operation_audit",
        "operation": operation,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": crate::observability::preview(&args.to_string(), 200),
    });
    tracing::info!(audit = %audit.to_string(), "operation");
}
