//! 执行循环过程事件：用于流式展示决策、操作调用、观察与回退

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 步数更新（当前第几步）
    StepUpdate { step: usize, max_steps: usize },
    /// 正在请求控制器决策
    Deciding,
    OperationCall {
        operation: String,
        arguments: serde_json::Value,
    },
    /// 操作返回（预览，避免过长）
    Observation {
        operation: String,
        ok: bool,
        preview: String,
    },
    /// 自动触发了实时抓取回退
    FallbackTriggered { identifier: String },
    /// 错误恢复动作（RetryWithPrompt / Stop）
    Recovery { action: String, detail: String },
    Stopped { reason: String, steps: usize },
}

pub(crate) fn send_event(
    tx: &Option<tokio::sync::mpsc::UnboundedSender<LoopEvent>>,
    ev: LoopEvent,
) {
    if let Some(tx) = tx {
        let _ = tx.send(ev);
    }
}
