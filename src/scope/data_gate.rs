//! 第二道范围门控：检查本轮所有操作结果里出现的配件实体
//!
//! 任一实体不属于受支持类别，整轮拒绝：不生成回答，也不产生会话引用。
//! 缺失类别的实体交给分类器推断，同一实体每轮最多分类一次，多个实体并发分类。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use crate::react::{extract_entities, EntityRef, Observation};
use crate::scope::{Classifier, UNKNOWN};
use crate::session::{Category, EntityKey};

/// 推断类别时给分类器的选项：两个受支持类别之外再给出常见的越界家电。
/// "freezer" 经 `Category::parse` 归入冰箱
const CATEGORY_OPTIONS: &[&str] = &[
    "refrigerator",
    "dishwasher",
    "microwave",
    "oven",
    "range",
    "washer",
    "dryer",
    "freezer",
    "other",
];

/// 越界实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffendingEntity {
    pub key: EntityKey,
    pub name: Option<String>,
    /// 声明或推断出的类别，推断不出时为 "unknown"
    pub category: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataGateDecision {
    /// 全部实体在范围内；附带每个实体的类别，供会话更新使用
    Pass { categories: HashMap<EntityKey, Category> },
    Reject {
        offending: Vec<OffendingEntity>,
        message: String,
    },
}

impl DataGateDecision {
    pub fn passed(&self) -> bool {
        matches!(self, DataGateDecision::Pass { .. })
    }
}

pub struct DataScopeGate {
    classifier: Arc<dyn Classifier>,
}

impl DataScopeGate {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    pub async fn check(&self, observations: &[Observation]) -> DataGateDecision {
        let entities = collect_entities(observations);
        if entities.is_empty() {
            return DataGateDecision::Pass {
                categories: HashMap::new(),
            };
        }

        let missing: Vec<&EntityRef> = entities.iter().filter(|e| e.category.is_none()).collect();
        let labels = join_all(missing.iter().map(|e| self.infer(e))).await;
        let mut inferred: HashMap<EntityKey, String> = missing
            .iter()
            .map(|e| e.key.clone())
            .zip(labels)
            .collect();

        let mut categories = HashMap::new();
        let mut offending = Vec::new();
        for entity in entities {
            let label = match &entity.category {
                Some(declared) => declared.clone(),
                None => inferred.remove(&entity.key).unwrap_or_else(|| UNKNOWN.to_string()),
            };
            match Category::parse(&label) {
                Some(category) if !entity.out_of_scope => {
                    categories.insert(entity.key, category);
                }
                _ => {
                    tracing::info!(key = %entity.key, category = %label, "entity outside supported categories");
                    offending.push(OffendingEntity {
                        key: entity.key,
                        name: entity.name,
                        category: label,
                    });
                }
            }
        }

        if offending.is_empty() {
            DataGateDecision::Pass { categories }
        } else {
            let message = data_rejection_message(&offending);
            DataGateDecision::Reject { offending, message }
        }
    }

    async fn infer(&self, entity: &EntityRef) -> String {
        let text = if entity.description.is_empty() {
            format!("Part {}", entity.key)
        } else {
            format!("Part {}\n{}", entity.key, entity.description)
        };
        let label = self
            .classifier
            .classify(
                &format!("Which appliance is this part for?\n{}", text),
                CATEGORY_OPTIONS,
            )
            .await;
        tracing::debug!(key = %entity.key, category = %label, "inferred missing category");
        label
    }
}

/// 跨所有结果按配件号去重：保留首次出现的声明类别，越界标记取并集，描述取最长
fn collect_entities(observations: &[Observation]) -> Vec<EntityRef> {
    let mut order: Vec<EntityKey> = Vec::new();
    let mut merged: HashMap<EntityKey, EntityRef> = HashMap::new();
    for obs in observations {
        for entity in extract_entities(&obs.result.payload) {
            match merged.get_mut(&entity.key) {
                Some(existing) => {
                    if existing.category.is_none() {
                        existing.category = entity.category;
                    }
                    if existing.name.is_none() {
                        existing.name = entity.name;
                    }
                    existing.out_of_scope |= entity.out_of_scope;
                    if entity.description.len() > existing.description.len() {
                        existing.description = entity.description;
                    }
                }
                None => {
                    order.push(entity.key.clone());
                    merged.insert(entity.key.clone(), entity);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|k| merged.remove(&k))
        .collect()
}

fn title_case(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn display_category(label: &str) -> String {
    if label.eq_ignore_ascii_case(UNKNOWN) || label.is_empty() {
        "different appliance".to_string()
    } else {
        title_case(label)
    }
}

/// 拒绝说明：逐个点名越界配件及其类别
pub fn data_rejection_message(offending: &[OffendingEntity]) -> String {
    let label = |e: &OffendingEntity| match &e.name {
        Some(name) => format!("{} ({})", name, e.key),
        None => e.key.to_string(),
    };
    let closing = "I can only help with refrigerator and dishwasher parts. \
If you have a question about a refrigerator or dishwasher part, I'd be happy to help!";
    match offending {
        [single] => format!(
            "I'm sorry, but **{}** is a part for a **{}**, not a refrigerator or dishwasher. {}",
            label(single),
            display_category(&single.category),
            closing
        ),
        many => {
            let lines = many
                .iter()
                .map(|e| format!("- {} - {}", label(e), display_category(&e.category)))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "I'm sorry, but these parts are not for a refrigerator or dishwasher:\n{}\n\n{}",
                lines, closing
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::{ToolCall, ToolResult};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// 按描述里的关键字返回类别，并记录调用
    #[derive(Default)]
    struct Keyword {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Classifier for Keyword {
        async fn classify(&self, text: &str, _options: &[&str]) -> String {
            self.seen.lock().unwrap().push(text.to_string());
            if text.contains("Chain") {
                "other".to_string()
            } else if text.contains("Ice Tray") {
                "freezer".to_string()
            } else if text.contains("Rack") {
                "dishwasher".to_string()
            } else {
                UNKNOWN.to_string()
            }
        }
    }

    fn obs(step: usize, op: &str, payload: Value) -> Observation {
        Observation {
            step,
            call: ToolCall::new(op, json!({})),
            result: ToolResult::ok(op, payload),
        }
    }

    #[tokio::test]
    async fn test_all_declared_in_scope_passes_without_classifier() {
        let classifier = Arc::new(Keyword::default());
        let gate = DataScopeGate::new(classifier.clone());
        let decision = gate
            .check(&[obs(
                1,
                "search_parts",
                json!([
                    {"ps_number": "PS1", "part_name": "Bin", "appliance_type": "Refrigerator"},
                    {"ps_number": "PS2", "part_name": "Rack", "appliance_type": "dishwasher"}
                ]),
            )])
            .await;
        match decision {
            DataGateDecision::Pass { categories } => {
                assert_eq!(categories.len(), 2);
                assert_eq!(categories[&EntityKey::parse("PS1").unwrap()], Category::Refrigerator);
            }
            other => panic!("expected pass, got {:?}", other),
        }
        assert!(classifier.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_offender_rejects_whole_turn() {
        let gate = DataScopeGate::new(Arc::new(Keyword::default()));
        let decision = gate
            .check(&[
                obs(1, "get_part", json!({"ps_number": "PS1", "part_name": "Bin", "appliance_type": "refrigerator"})),
                obs(2, "get_part", json!({"ps_number": "PS9", "part_name": "Turntable", "appliance_type": "microwave"})),
            ])
            .await;
        match decision {
            DataGateDecision::Reject { offending, message } => {
                assert_eq!(offending.len(), 1);
                assert_eq!(offending[0].key.as_str(), "PS9");
                assert!(message.contains("**Turntable (PS9)** is a part for a **Microwave**"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_category_classified_once_per_entity() {
        let classifier = Arc::new(Keyword::default());
        let gate = DataScopeGate::new(classifier.clone());
        let live = json!({"ps_number": "PS3", "part_name": "Saw Chain", "fetched_live": true});
        let decision = gate
            .check(&[
                obs(1, "fetch_part_live", live.clone()),
                obs(2, "fetch_part_live", live),
                obs(3, "get_part", json!({"ps_number": "PS4", "part_name": "Upper Rack"})),
            ])
            .await;
        assert_eq!(classifier.seen.lock().unwrap().len(), 2);
        match decision {
            DataGateDecision::Reject { offending, message } => {
                assert_eq!(offending.len(), 1);
                assert_eq!(offending[0].category, "other");
                assert!(message.contains("Saw Chain (PS3)"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_freezer_label_counts_as_refrigerator() {
        let classifier = Arc::new(Keyword::default());
        let gate = DataScopeGate::new(classifier.clone());
        let decision = gate
            .check(&[obs(1, "fetch_part_live", json!({"ps_number": "PS7", "part_name": "Ice Tray"}))])
            .await;
        match decision {
            DataGateDecision::Pass { categories } => {
                assert_eq!(categories[&EntityKey::parse("PS7").unwrap()], Category::Refrigerator);
            }
            other => panic!("expected pass, got {:?}", other),
        }
        assert_eq!(classifier.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_flagged_are_offending() {
        let gate = DataScopeGate::new(Arc::new(Keyword::default()));
        let decision = gate
            .check(&[obs(
                1,
                "search_parts",
                json!([
                    {"ps_number": "PS5", "part_name": "Widget"},
                    {"ps_number": "PS6", "part_name": "Rack", "appliance_type": "dishwasher", "out_of_scope": true}
                ]),
            )])
            .await;
        match decision {
            DataGateDecision::Reject { offending, message } => {
                assert_eq!(offending.len(), 2);
                assert_eq!(offending[0].category, UNKNOWN);
                assert!(message.contains("- Widget (PS5) - different appliance"));
                assert!(message.contains("- Rack (PS6) - Dishwasher"));
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_entities_passes() {
        let gate = DataScopeGate::new(Arc::new(Keyword::default()));
        let decision = gate
            .check(&[obs(1, "check_compatibility", json!({"compatible": true}))])
            .await;
        assert!(decision.passed());
    }
}
