//! search 类操作：配件文本搜索、相似度搜索，以及按配件号限定的问答 / 维修故事 / 评价检索
//!
//! 搜索无结果返回空列表，不是 NotFound，因此不会触发回退。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::OpError;
use crate::store::{rank_similar, PartQuery, SimilarityCollection, SimilarityStore, StructuredStore};
use crate::tools::lookup::{optional_str, part_key, required_str};
use crate::tools::{Operation, OperationCategory, OperationContext};

const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 20;

fn limit_arg(args: &Value) -> usize {
    args.get("limit")
        .and_then(Value::as_u64)
        .map(|n| (n as usize).clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT)
}

pub struct SearchPartsOp {
    store: Arc<dyn StructuredStore>,
}

impl SearchPartsOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for SearchPartsOp {
    fn name(&self) -> &str {
        "search_parts"
    }

    fn description(&self) -> &str {
        "Keyword search over part names, types, descriptions and manufacturer numbers, with optional filters."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Search
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "appliance_type": { "type": "string", "enum": ["refrigerator", "dishwasher"] },
                "part_type": { "type": "string" },
                "brand": { "type": "string" },
                "max_price": { "type": "number" },
                "in_stock_only": { "type": "boolean" },
                "limit": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let query = PartQuery {
            query: Some(required_str(&args, "query")?.to_string()),
            appliance_type: optional_str(&args, "appliance_type").map(str::to_lowercase),
            part_type: optional_str(&args, "part_type").map(str::to_string),
            brand: optional_str(&args, "brand").map(str::to_string),
            max_price: args.get("max_price").and_then(Value::as_f64),
            in_stock_only: args.get("in_stock_only").and_then(Value::as_bool).unwrap_or(false),
            limit: Some(limit_arg(&args)),
        };
        let parts = self.store.search_parts(&query).await?;
        serde_json::to_value(&parts).map_err(|e| OpError::invalid_input(e.to_string()))
    }
}

pub struct SearchPartsSemanticOp {
    store: Arc<dyn SimilarityStore>,
}

impl SearchPartsSemanticOp {
    pub fn new(store: Arc<dyn SimilarityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for SearchPartsSemanticOp {
    fn name(&self) -> &str {
        "search_parts_semantic"
    }

    fn description(&self) -> &str {
        "Similarity search for parts from a natural-language description (\"the thing that holds the top rack\")."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Search
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "appliance_type": { "type": "string", "enum": ["refrigerator", "dishwasher"] },
                "limit": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let query = required_str(&args, "query")?;
        let limit = limit_arg(&args);
        let appliance = optional_str(&args, "appliance_type");
        // 先多取一些再按类别过滤
        let fetch = if appliance.is_some() { MAX_LIMIT } else { limit };
        let hits = self
            .store
            .search_similar(SimilarityCollection::Parts, query, None, fetch)
            .await?;
        let hits: Vec<Value> = hits
            .into_iter()
            .filter(|h| match appliance {
                Some(a) => h
                    .get("appliance_type")
                    .and_then(Value::as_str)
                    .map(|t| t.eq_ignore_ascii_case(a))
                    .unwrap_or(false),
                None => true,
            })
            .take(limit)
            .collect();
        Ok(Value::Array(hits))
    }
}

/// 限定到单个配件号的用户内容检索（问答 / 维修故事 / 评价）
pub struct ScopedContentSearch {
    store: Arc<dyn SimilarityStore>,
    name: &'static str,
    description: &'static str,
    collection: SimilarityCollection,
    /// 实时抓取结果中对应子集合的字段名
    live_field: &'static str,
    /// 子集合条目中用于打分的文本字段
    text_fields: &'static [&'static str],
}

impl ScopedContentSearch {
    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "ps_number": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["query", "ps_number"]
        })
    }
}

#[async_trait]
impl Operation for ScopedContentSearch {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Search
    }

    fn parameters_schema(&self) -> Value {
        Self::schema()
    }

    fn identifier_arg(&self) -> Option<&str> {
        Some("ps_number")
    }

    fn answer_from_live(&self, live: &Value, args: &Value) -> Option<Value> {
        let items = live.get(self.live_field)?.as_array()?;
        let query = optional_str(args, "query").unwrap_or_default();
        let docs = items.iter().map(|item| {
            let text = self
                .text_fields
                .iter()
                .filter_map(|f| item.get(*f).and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            (text, item.clone())
        });
        Some(Value::Array(rank_similar(query, docs, 0.0, limit_arg(args))))
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let query = required_str(&args, "query")?;
        let key = part_key(&args, "ps_number")?;
        let hits = self
            .store
            .search_similar(self.collection, query, Some(key.as_str()), limit_arg(&args))
            .await?;
        Ok(Value::Array(hits))
    }
}

pub struct SearchQnaOp;
pub struct SearchRepairStoriesOp;
pub struct SearchReviewsOp;

impl SearchQnaOp {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(store: Arc<dyn SimilarityStore>) -> ScopedContentSearch {
        ScopedContentSearch {
            store,
            name: "search_qna",
            description: "Customer questions and answers about one part (fit, installation, usage).",
            collection: SimilarityCollection::Qna,
            live_field: "qna",
            text_fields: &["question", "answer"],
        }
    }
}

impl SearchRepairStoriesOp {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(store: Arc<dyn SimilarityStore>) -> ScopedContentSearch {
        ScopedContentSearch {
            store,
            name: "search_repair_stories",
            description: "Customer repair stories for one part: how they installed it, difficulty, time taken.",
            collection: SimilarityCollection::RepairStories,
            live_field: "repair_stories",
            text_fields: &["title", "instruction"],
        }
    }
}

impl SearchReviewsOp {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(store: Arc<dyn SimilarityStore>) -> ScopedContentSearch {
        ScopedContentSearch {
            store,
            name: "search_reviews",
            description: "Customer reviews for one part (quality, fit, durability).",
            collection: SimilarityCollection::Reviews,
            live_field: "reviews",
            text_fields: &["title", "review_text"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::fixtures::sample_snapshot;
    use crate::store::MemoryCatalog;

    fn catalog() -> Arc<MemoryCatalog> {
        Arc::new(MemoryCatalog::new(sample_snapshot()))
    }

    #[tokio::test]
    async fn test_search_parts_filters() {
        let op = SearchPartsOp::new(catalog());
        let ctx = OperationContext::default();
        let out = op
            .execute(json!({"query": "rack", "appliance_type": "Dishwasher"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 1);
        let none = op
            .execute(json!({"query": "rack", "max_price": 10.0}), &ctx)
            .await
            .unwrap();
        assert!(none.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_semantic_search_category_filter() {
        let op = SearchPartsSemanticOp::new(catalog());
        let ctx = OperationContext::default();
        let out = op
            .execute(json!({"query": "ice maker", "appliance_type": "dishwasher"}), &ctx)
            .await
            .unwrap();
        assert!(out.as_array().unwrap().is_empty());
        let out = op.execute(json!({"query": "ice maker"}), &ctx).await.unwrap();
        assert_eq!(out[0]["ps_number"], "PS11739119");
    }

    #[tokio::test]
    async fn test_scoped_qna_search() {
        let op = SearchQnaOp::new(catalog());
        let ctx = OperationContext::default();
        let out = op
            .execute(json!({"query": "side by side door", "ps_number": "PS11752778"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 1);
        let other = op
            .execute(json!({"query": "side by side door", "ps_number": "PS11739119"}), &ctx)
            .await
            .unwrap();
        assert!(other.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_reviews_from_live_payload() {
        let op = SearchReviewsOp::new(catalog());
        let live = json!({
            "ps_number": "PS16219058",
            "reviews": [
                {"title": "Leaked", "review_text": "valve cracked after a month"},
                {"title": "Perfect fit", "review_text": "easy install, stopped the leak"}
            ]
        });
        let out = op
            .answer_from_live(&live, &json!({"query": "easy install", "ps_number": "PS16219058"}))
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
        assert_eq!(out[0]["title"], "Perfect fit");
        assert!(op.answer_from_live(&json!({"ps_number": "PS1"}), &json!({})).is_none());
    }
}
