//! fallback 类操作：fetch_part_live
//!
//! 先经过全局并发许可，再在独立任务里执行抓取；执行器的回退超时只放弃等待，
//! 抓取任务自己跑完并释放许可与浏览器。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{ErrorKind, FallbackAdmission, OpError};
use crate::fallback::LiveFetcher;
use crate::session::EntityKey;
use crate::tools::lookup::required_str;
use crate::tools::{Operation, OperationCategory, OperationContext};

pub struct FetchPartLiveOp {
    fetcher: Arc<dyn LiveFetcher>,
    admission: FallbackAdmission,
}

impl FetchPartLiveOp {
    pub fn new(fetcher: Arc<dyn LiveFetcher>, admission: FallbackAdmission) -> Self {
        Self { fetcher, admission }
    }
}

#[async_trait]
impl Operation for FetchPartLiveOp {
    fn name(&self) -> &str {
        "fetch_part_live"
    }

    fn description(&self) -> &str {
        "SLOW (5-30s). Fetch a part live from the retailer site when it is missing from the catalog. Returns the part plus compatible_models, qna, repair_stories and reviews. Use at most once per part."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Fallback
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ps_number": { "type": "string" } },
            "required": ["ps_number"]
        })
    }

    fn identifier_arg(&self) -> Option<&str> {
        Some("ps_number")
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let raw = required_str(&args, "ps_number")?;
        let key = EntityKey::parse(raw)
            .ok_or_else(|| OpError::invalid_input(format!("invalid PS number format: {}. Must start with 'PS'", raw)))?;

        let permit = self.admission.acquire().await?;
        let fetcher = self.fetcher.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            fetcher.fetch(&task_key).await
        });

        let live = match handle.await {
            Ok(fetched) => fetched?,
            Err(e) => {
                return Err(OpError::new(
                    ErrorKind::UpstreamUnavailable,
                    format!("live fetch task failed: {}", e),
                ))
            }
        };
        if !live.part.ps_number.eq_ignore_ascii_case(key.as_str()) {
            tracing::warn!(identifier = %key, fetched = %live.part.ps_number, "live fetch returned a different part");
        }

        let mut payload = serde_json::to_value(&live).map_err(|e| OpError::invalid_input(e.to_string()))?;
        if let Value::Object(ref mut map) = payload {
            map.insert("fetched_live".to_string(), Value::Bool(true));
        }
        tracing::info!(
            identifier = %key,
            models = live.compatible_models.len(),
            qna = live.qna.len(),
            stories = live.repair_stories.len(),
            reviews = live.reviews.len(),
            "live fetch succeeded"
        );
        Ok(payload)
    }
}
