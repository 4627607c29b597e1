//! 实时抓取回退
//!
//! lookup 操作报告 NotFound 且调用参数里带配件号时，`FallbackOrchestrator` 为该配件号触发一次
//! 实时抓取（每轮每个配件号至多一次），结果以 `fallback::<op>` 为名追加到观察序列。
//! 成功结果携带嵌套子集合（适配型号、问答、维修故事、评价），同轮及后续轮次的子集合请求
//! 直接由该结果回答，不再抓取。失败结果照常作为观察，不自动重试。

#[cfg(feature = "browser")]
pub mod browser;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::{ErrorKind, OpError};
use crate::react::{Observation, ResultSource, ToolCall, ToolResult};
use crate::session::{EntityKey, Session};
use crate::store::LivePart;
use crate::tools::{Operation, OperationCategory, OperationContext, OperationExecutor, OperationRegistry};

#[cfg(feature = "browser")]
pub use browser::ChromeFetcher;

/// 回退操作的默认参数名
const DEFAULT_IDENTIFIER_ARG: &str = "ps_number";

/// 实时抓取失败
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("part {0} not found on the live site")]
    NotFound(String),

    #[error("live fetch unavailable: {0}")]
    Unavailable(String),

    #[error("live fetch timed out: {0}")]
    Timeout(String),
}

impl From<FetchError> for OpError {
    fn from(e: FetchError) -> Self {
        let kind = match e {
            FetchError::NotFound(_) => ErrorKind::NotFound,
            FetchError::Unavailable(_) => ErrorKind::UpstreamUnavailable,
            FetchError::Timeout(_) => ErrorKind::Timeout,
        };
        OpError::new(kind, e.to_string())
    }
}

/// 带外抓取端：对调用方是一次同步请求，内部持有的浏览器等资源必须在所有退出路径上释放
#[async_trait]
pub trait LiveFetcher: Send + Sync {
    async fn fetch(&self, key: &EntityKey) -> Result<LivePart, FetchError>;
}

/// 单轮内的回退记录：配件号 → 是否已触发及其结果；轮结束即丢弃
#[derive(Debug, Default)]
pub struct FallbackRecord {
    outcomes: BTreeMap<EntityKey, Option<ToolResult>>,
}

impl FallbackRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggered(&self, key: &EntityKey) -> bool {
        self.outcomes.contains_key(key)
    }

    /// 标记已触发；之前未触发时返回 true
    pub fn mark(&mut self, key: EntityKey) -> bool {
        if self.outcomes.contains_key(&key) {
            return false;
        }
        self.outcomes.insert(key, None);
        true
    }

    pub fn store(&mut self, key: EntityKey, result: ToolResult) {
        self.outcomes.insert(key, Some(result));
    }

    pub fn result_for(&self, key: &EntityKey) -> Option<&ToolResult> {
        self.outcomes.get(key).and_then(Option::as_ref)
    }

    /// 成功的实时结果
    pub fn live_payload(&self, key: &EntityKey) -> Option<&Value> {
        self.result_for(key)
            .filter(|r| !r.is_error())
            .map(|r| &r.payload)
    }

    /// 本轮真正发起抓取的次数
    pub fn fetch_count(&self) -> usize {
        self.outcomes
            .values()
            .flatten()
            .filter(|r| r.source != ResultSource::LiveCache)
            .count()
    }

    /// 本轮成功的实时结果，供轮结束后写入会话缓存
    pub fn successes(&self) -> impl Iterator<Item = (&EntityKey, &Value)> {
        self.outcomes.iter().filter_map(|(k, r)| match r {
            Some(r) if !r.is_error() && r.source != ResultSource::LiveCache => Some((k, &r.payload)),
            _ => None,
        })
    }
}

/// 回退编排器：持有注册表中 fallback 类别的操作；没有时整个回退机制关闭
#[derive(Clone)]
pub struct FallbackOrchestrator {
    operation: Option<Arc<dyn Operation>>,
}

impl FallbackOrchestrator {
    pub fn new(registry: &OperationRegistry) -> Self {
        Self {
            operation: registry.fallback_operation(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.operation.is_some()
    }

    fn identifier_arg(op: &dyn Operation) -> &str {
        op.identifier_arg().unwrap_or(DEFAULT_IDENTIFIER_ARG)
    }

    fn synthetic_name(op: &dyn Operation) -> String {
        format!("fallback::{}", op.name())
    }

    /// 调用所涉配件号若已有实时结果（本轮或会话缓存），由操作自己从中作答
    pub fn answer_from_live(
        &self,
        op: &dyn Operation,
        call: &ToolCall,
        record: &FallbackRecord,
        session: Option<&Session>,
    ) -> Option<ToolResult> {
        let arg = op.identifier_arg()?;
        let key = EntityKey::parse(call.arg_str(arg)?)?;
        let live = record
            .live_payload(&key)
            .or_else(|| session.and_then(|s| s.live_result(&key)))?;
        let payload = op.answer_from_live(live, &call.arguments)?;
        tracing::debug!(operation = %call.operation, identifier = %key, "answered from live result");
        Some(ToolResult::ok(&call.operation, payload).with_source(ResultSource::LiveCache))
    }

    /// 控制器显式调用回退操作：同轮同配件号只抓一次，会话里已有结果时不抓
    pub async fn run_explicit(
        &self,
        op: &dyn Operation,
        call: &ToolCall,
        executor: &OperationExecutor,
        ctx: &OperationContext<'_>,
        record: &mut FallbackRecord,
    ) -> ToolResult {
        let Some(key) = call
            .arg_str(Self::identifier_arg(op))
            .and_then(EntityKey::parse)
        else {
            // 格式错误由操作自身报告 InvalidInput
            return executor.execute(call, ctx).await;
        };
        if let Some(previous) = record.result_for(&key) {
            tracing::debug!(identifier = %key, "live fetch already attempted this turn");
            let mut reused = previous.clone().with_source(ResultSource::Deduplicated);
            reused.operation = call.operation.clone();
            return reused;
        }
        record.mark(key.clone());
        let result = match ctx.session.and_then(|s| s.live_result(&key)) {
            Some(live) => ToolResult::ok(&call.operation, live.clone()).with_source(ResultSource::LiveCache),
            None => executor.execute(call, ctx).await,
        };
        record.store(key, result.clone());
        result
    }

    /// 检查一条观察：NotFound ∧ lookup ∧ 参数中可提取配件号 ∧ 本轮未触发 ⇒ 触发回退
    pub async fn intercept(
        &self,
        observation: &Observation,
        executor: &OperationExecutor,
        ctx: &OperationContext<'_>,
        record: &mut FallbackRecord,
    ) -> Option<Observation> {
        if observation.result.error_kind() != Some(ErrorKind::NotFound)
            || observation.result.source != ResultSource::Operation
        {
            return None;
        }
        let fallback = self.operation.as_ref()?;
        let failed = executor.registry().get_handler(&observation.call.operation)?;
        if failed.category() != OperationCategory::Lookup {
            return None;
        }
        let arg = failed.identifier_arg()?;
        // 缺失的是别的参数（如型号）时配件本身在目录里，不抓取
        if let Some(missing) = observation.result.error.as_ref().and_then(|e| e.missing_arg()) {
            if missing != arg {
                tracing::debug!(operation = %observation.call.operation, missing, "not found on a non-identifier argument");
                return None;
            }
        }
        let key = observation.call.arg_str(arg).and_then(EntityKey::parse)?;
        if !record.mark(key.clone()) {
            tracing::debug!(identifier = %key, "fallback already triggered this turn");
            return None;
        }

        let mut args = serde_json::Map::new();
        args.insert(
            Self::identifier_arg(fallback.as_ref()).to_string(),
            Value::from(key.as_str()),
        );
        let call = ToolCall::new(fallback.name(), Value::Object(args));
        let mut result = match ctx.session.and_then(|s| s.live_result(&key)) {
            Some(live) => ToolResult::ok(fallback.name(), live.clone()).with_source(ResultSource::LiveCache),
            None => {
                tracing::info!(identifier = %key, operation = %observation.call.operation, "triggering live fallback");
                executor.execute(&call, ctx).await.with_source(ResultSource::Fallback)
            }
        };
        result.operation = Self::synthetic_name(fallback.as_ref());
        record.store(key, result.clone());
        Some(Observation {
            step: observation.step,
            call,
            result,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 记录调用次数的抓取端；未登记的配件号返回 NotFound
    #[derive(Default)]
    pub struct StubFetcher {
        pub parts: Mutex<BTreeMap<String, LivePart>>,
        pub calls: AtomicUsize,
    }

    impl StubFetcher {
        pub fn with_part(live: LivePart) -> Self {
            let fetcher = Self::default();
            if let Ok(mut parts) = fetcher.parts.lock() {
                parts.insert(live.part.ps_number.clone(), live);
            }
            fetcher
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LiveFetcher for StubFetcher {
        async fn fetch(&self, key: &EntityKey) -> Result<LivePart, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let parts = self
                .parts
                .lock()
                .map_err(|e| FetchError::Unavailable(e.to_string()))?;
            parts
                .get(key.as_str())
                .cloned()
                .ok_or_else(|| FetchError::NotFound(key.to_string()))
        }
    }
}
