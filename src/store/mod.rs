//! 外部数据存储接口与实现
//!
//! - `StructuredStore`：精确查找 / 文本搜索 / 关系判断；「无数据」返回 None 或空列表，只有故障才是 `StoreError`
//! - `SimilarityStore`：相似度检索，无结果时返回空列表
//! - `MemoryCatalog`（JSON 快照）与 `SqliteCatalog`（rusqlite）两种实现

pub mod memory;
pub mod sqlite;
pub mod types;

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

pub use crate::core::StoreError;
pub use memory::MemoryCatalog;
pub use sqlite::SqliteCatalog;
pub use types::{
    ApplianceModel, CatalogSnapshot, CompatibilityLink, LivePart, Part, PartList, PartQuery,
    QnaEntry, RepairInstruction, RepairStory, Review, SimilarityCollection, Symptom,
};

/// 结构化存储
#[async_trait]
pub trait StructuredStore: Send + Sync {
    async fn get_part(&self, ps_number: &str) -> Result<Option<Part>, StoreError>;

    /// 按厂商件号精确匹配（大小写不敏感）
    async fn find_by_manufacturer_number(&self, code: &str) -> Result<Option<Part>, StoreError>;

    /// 厂商件号包含匹配
    async fn find_by_manufacturer_number_partial(&self, code: &str)
        -> Result<Vec<Part>, StoreError>;

    async fn get_model(&self, model_number: &str) -> Result<Option<ApplianceModel>, StoreError>;

    async fn find_models_fuzzy(&self, input: &str) -> Result<Vec<ApplianceModel>, StoreError>;

    async fn search_parts(&self, query: &PartQuery) -> Result<Vec<Part>, StoreError>;

    /// None：配件或型号不存在
    async fn check_compatibility(
        &self,
        ps_number: &str,
        model_number: &str,
    ) -> Result<Option<bool>, StoreError>;

    /// None：型号不存在
    async fn get_compatible_parts(
        &self,
        model_number: &str,
        part_type: Option<&str>,
        brand: Option<&str>,
    ) -> Result<Option<Vec<Part>>, StoreError>;

    /// None：配件不存在
    async fn get_compatible_models(
        &self,
        ps_number: &str,
        brand: Option<&str>,
    ) -> Result<Option<Vec<ApplianceModel>>, StoreError>;

    /// symptom 给定时只返回最匹配的一条
    async fn get_symptoms(
        &self,
        appliance_type: &str,
        symptom: Option<&str>,
    ) -> Result<Vec<Symptom>, StoreError>;

    async fn get_repair_instructions(
        &self,
        appliance_type: &str,
        symptom: &str,
        part_type: Option<&str>,
    ) -> Result<Vec<RepairInstruction>, StoreError>;
}

/// 相似度存储
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// scope_key 限定到某个配件号；每条结果带 `similarity` 字段
    async fn search_similar(
        &self,
        collection: SimilarityCollection,
        query: &str,
        scope_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError>;
}

/// 默认相似度阈值
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.3;

pub(crate) fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// 查询词在文档中的覆盖率（0.0..=1.0）
pub(crate) fn token_overlap(query: &str, document: &str) -> f64 {
    let q = tokenize(query);
    if q.is_empty() {
        return 0.0;
    }
    let d = tokenize(document);
    let hits = q.iter().filter(|t| d.contains(*t)).count();
    hits as f64 / q.len() as f64
}

/// 对 (文档文本, 记录) 打分、过阈值、降序取前 limit 条，并写入 similarity 字段
pub(crate) fn rank_similar(
    query: &str,
    docs: impl IntoIterator<Item = (String, Value)>,
    threshold: f64,
    limit: usize,
) -> Vec<Value> {
    let mut scored: Vec<(f64, Value)> = docs
        .into_iter()
        .map(|(text, record)| (token_overlap(query, &text), record))
        .filter(|(score, _)| *score >= threshold)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(score, mut record)| {
            if let Value::Object(ref mut map) = record {
                map.insert("similarity".to_string(), Value::from((score * 100.0).round() / 100.0));
            }
            record
        })
        .collect()
}

/// 相似度检索用的文档文本
pub(crate) fn part_document(p: &Part) -> String {
    format!(
        "{} {} {}",
        p.part_name,
        p.part_type.as_deref().unwrap_or(""),
        p.part_description.as_deref().unwrap_or("")
    )
}

pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// 文本搜索匹配：所有查询词都出现在名称 / 类型 / 描述 / 厂商件号中
pub(crate) fn part_matches_text(p: &Part, query: &str) -> bool {
    let haystack = format!(
        "{} {}",
        part_document(p),
        p.manufacturer_part_number.as_deref().unwrap_or("")
    );
    let terms = tokenize(query);
    !terms.is_empty() && {
        let doc = tokenize(&haystack);
        terms.iter().all(|t| doc.contains(t))
    }
}

/// 文本搜索过滤条件（文本之外的部分）
pub(crate) fn part_matches_filters(p: &Part, q: &PartQuery) -> bool {
    let eq = |field: &Option<String>, want: &Option<String>| match want {
        Some(w) => field.as_deref().map(|f| f.eq_ignore_ascii_case(w)).unwrap_or(false),
        None => true,
    };
    eq(&p.appliance_type, &q.appliance_type)
        && q.part_type
            .as_deref()
            .map(|t| p.part_type.as_deref().map(|pt| contains_ci(pt, t)).unwrap_or(false))
            .unwrap_or(true)
        && eq(&p.brand, &q.brand)
        && q.max_price
            .map(|max| p.part_price.map(|price| price <= max).unwrap_or(false))
            .unwrap_or(true)
        && (!q.in_stock_only || p.in_stock())
}

/// 在候选症状中挑出与描述最接近的一条
pub(crate) fn best_symptom_match<'a, T>(
    items: impl IntoIterator<Item = &'a T>,
    wanted: &str,
    text_of: impl Fn(&T) -> &str,
) -> Option<&'a T>
where
    T: 'a,
{
    let mut best: Option<(f64, &'a T)> = None;
    for item in items {
        let name = text_of(item);
        let score = if contains_ci(name, wanted) || contains_ci(wanted, name) {
            1.0
        } else {
            token_overlap(wanted, name)
        };
        if score > 0.0 && best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, item));
        }
    }
    best.map(|(_, item)| item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_overlap() {
        assert_eq!(token_overlap("ice maker", "Ice Maker Assembly"), 1.0);
        assert_eq!(token_overlap("ice tray", "Ice Maker Assembly"), 0.5);
        assert_eq!(token_overlap("", "anything"), 0.0);
    }

    #[test]
    fn test_rank_similar_threshold_and_order() {
        let docs = vec![
            ("water filter".to_string(), json!({"id": 1})),
            ("ice maker water line".to_string(), json!({"id": 2})),
            ("door gasket".to_string(), json!({"id": 3})),
        ];
        let ranked = rank_similar("ice maker", docs, 0.3, 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0]["id"], 2);
        assert_eq!(ranked[0]["similarity"], 1.0);

        let none = rank_similar("compressor", Vec::<(String, Value)>::new(), 0.3, 5);
        assert!(none.is_empty());
    }

    #[test]
    fn test_best_symptom_match() {
        let names = vec!["Leaking".to_string(), "Not draining".to_string(), "Noisy".to_string()];
        let hit = best_symptom_match(&names, "dishwasher not draining water", |s| s.as_str());
        assert_eq!(hit.map(String::as_str), Some("Not draining"));
        assert!(best_symptom_match(&names, "zzz", |s| s.as_str()).is_none());
    }
}
