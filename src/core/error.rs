//! 错误类型与恢复动作
//!
//! 两类错误严格分开：
//! - `AgentError`：配置错误（启动时致命）、控制器错误（交给 RecoveryEngine 决定重试或停止）
//! - `OpError` / `ErrorKind`：操作级错误，作为观察数据写入 `ToolResult`，从不冒泡出执行循环

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 编排过程中可能出现的错误（配置、控制器、存储）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Duplicate operation registered: {0}")]
    DuplicateOperation(String),

    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Decision parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AgentError {
    /// 仅配置类错误在启动时致命
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::DuplicateOperation(_)
                | AgentError::MissingCollaborator(_)
                | AgentError::ConfigError(_)
        )
    }
}

/// 外部存储 / 抓取端的失败；「无数据」不是错误，用 None / 空列表表达
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// 操作级错误种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 存储中无此实体；lookup 类操作返回此错误时触发实时抓取回退
    NotFound,
    /// 标识格式错误，不重试、不触发回退
    InvalidInput,
    /// 解析得到多个候选，交给控制器澄清
    Ambiguous,
    /// 回退并发许可已满
    Overloaded,
    /// 外部存储或抓取端不可达（调用点重试一次）
    UpstreamUnavailable,
    /// 超出时限
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Ambiguous => "ambiguous",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作失败：种类 + 说明 + 可选的附带数据（如 Ambiguous 的候选列表）
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// NotFound 且指明缺失的是哪个参数，如配件存在而型号不存在
    pub fn not_found_arg(arg: &str, value: &str, message: impl Into<String>) -> Self {
        Self::not_found(message).with_details(serde_json::json!({ "missing": arg, arg: value }))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// `not_found_arg` 记录的缺失参数名
    pub fn missing_arg(&self) -> Option<&str> {
        self.details.as_ref()?.get("missing")?.as_str()
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<StoreError> for OpError {
    fn from(e: StoreError) -> Self {
        OpError::new(ErrorKind::UpstreamUnavailable, e.to_string())
    }
}

/// 恢复引擎根据控制器错误给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮决策（如 JSON 格式错误），消耗一步
    RetryWithPrompt(String),
    /// 以已有观察结束循环
    Stop,
}
