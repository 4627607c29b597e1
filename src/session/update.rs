//! 轮结束后的会话更新
//!
//! 只在第二道门控通过后调用：被拒绝的轮次不产生任何引用。

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::fallback::FallbackRecord;
use crate::react::{extract_entities, Observation};
use crate::session::{Category, EntityKey, Session};

/// 把本轮观察写入会话：配件引用、焦点型号 / 品牌 / 症状、实时抓取缓存
pub fn apply_observations(
    session: &mut Session,
    observations: &[Observation],
    categories: &HashMap<EntityKey, Category>,
    record: &FallbackRecord,
) {
    for obs in observations.iter().filter(|o| !o.result.is_error()) {
        for entity in extract_entities(&obs.result.payload) {
            if let Some(category) = categories.get(&entity.key) {
                session.reference(entity.key, *category);
            }
        }
        apply_focus(session, obs, categories);
    }

    for (key, payload) in record.successes() {
        if categories.contains_key(key) {
            session.cache_live_result(key.clone(), payload.clone());
        }
    }
    session.touch();
}

fn apply_focus(session: &mut Session, obs: &Observation, categories: &HashMap<EntityKey, Category>) {
    let call = &obs.call;
    match call.operation.as_str() {
        "resolve_model" => {
            let payload = &obs.result.payload;
            if payload.get("resolved").and_then(Value::as_bool) != Some(true) {
                return;
            }
            let category = payload
                .get("category")
                .and_then(Value::as_str)
                .and_then(Category::parse);
            if let (Some(category), Some(model)) = (category, payload.get("key").and_then(Value::as_str)) {
                session.focus_mut(category).model_number = Some(model.to_string());
                session.set_active_focus(category);
            }
        }
        "check_compatibility" => {
            let category = call
                .arg_str("ps_number")
                .and_then(EntityKey::parse)
                .and_then(|k| categories.get(&k).copied());
            if let (Some(category), Some(model)) = (category, call.arg_str("model_number")) {
                session.focus_mut(category).model_number = Some(model.to_uppercase());
                session.set_active_focus(category);
            }
        }
        "get_compatible_parts" => {
            let Some(category) = first_category(&obs.result.payload, categories) else {
                return;
            };
            let ctx = session.focus_mut(category);
            if let Some(model) = call.arg_str("model_number") {
                ctx.model_number = Some(model.to_uppercase());
            }
            if let Some(brand) = call.arg_str("brand") {
                ctx.brand = Some(brand.to_string());
            }
            session.set_active_focus(category);
        }
        "get_symptoms" | "get_repair_instructions" => {
            let Some(category) = call.arg_str("appliance_type").and_then(Category::parse) else {
                return;
            };
            if let Some(symptom) = call.arg_str("symptom") {
                session.focus_mut(category).current_symptom = Some(symptom.to_string());
            }
            session.set_active_focus(category);
        }
        _ => {}
    }
}

fn first_category(payload: &Value, categories: &HashMap<EntityKey, Category>) -> Option<Category> {
    extract_entities(payload)
        .into_iter()
        .find_map(|e| categories.get(&e.key).copied())
}

/// 回复后收窄：只保留回复中提到的配件号
pub fn narrow_to_mentioned(session: &mut Session, mentioned: &HashSet<EntityKey>) {
    let before = session.referenced_keys().len();
    session.retain_keys(mentioned);
    tracing::debug!(
        before,
        after = session.referenced_keys().len(),
        "narrowed referenced keys to response mentions"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OpError;
    use crate::react::{ToolCall, ToolResult};
    use serde_json::json;

    fn key(s: &str) -> EntityKey {
        EntityKey::parse(s).unwrap()
    }

    fn obs(op: &str, args: Value, payload: Value) -> Observation {
        Observation {
            step: 1,
            call: ToolCall::new(op, args),
            result: ToolResult::ok(op, payload),
        }
    }

    #[test]
    fn test_references_in_order_and_skips_errors() {
        let mut session = Session::new("s", 10);
        let categories = HashMap::from([
            (key("PS1"), Category::Refrigerator),
            (key("PS2"), Category::Dishwasher),
        ]);
        let observations = vec![
            obs("get_part", json!({"ps_number": "PS2"}), json!({"ps_number": "PS2", "part_name": "Rack"})),
            obs("get_part", json!({"ps_number": "PS1"}), json!({"ps_number": "PS1", "part_name": "Bin"})),
            Observation {
                step: 2,
                call: ToolCall::new("get_part", json!({"ps_number": "PS3"})),
                result: ToolResult::failed("get_part", OpError::not_found("missing")),
            },
        ];
        apply_observations(&mut session, &observations, &categories, &FallbackRecord::new());
        assert_eq!(session.referenced_keys(), &[key("PS2"), key("PS1")]);
        assert_eq!(session.focus(Category::Dishwasher).unwrap().referenced_keys, vec![key("PS2")]);
        assert!(session.is_consistent());
    }

    #[test]
    fn test_focus_from_symptom_and_compatibility_calls() {
        let mut session = Session::new("s", 10);
        let categories = HashMap::from([(key("PS1"), Category::Refrigerator)]);
        let observations = vec![
            obs(
                "get_symptoms",
                json!({"appliance_type": "dishwasher", "symptom": "Not draining"}),
                json!([{"symptom": "Not draining"}]),
            ),
            obs(
                "check_compatibility",
                json!({"ps_number": "PS1", "model_number": "wdt780saem1"}),
                json!({"ps_number": "PS1", "model_number": "WDT780SAEM1", "compatible": true}),
            ),
        ];
        apply_observations(&mut session, &observations, &categories, &FallbackRecord::new());
        assert_eq!(
            session.focus(Category::Dishwasher).unwrap().current_symptom.as_deref(),
            Some("Not draining")
        );
        assert_eq!(
            session.focus(Category::Refrigerator).unwrap().model_number.as_deref(),
            Some("WDT780SAEM1")
        );
        assert_eq!(session.active_focus, Some(Category::Refrigerator));
    }

    #[test]
    fn test_live_results_cached_for_allowed_keys() {
        let mut session = Session::new("s", 10);
        let mut record = FallbackRecord::new();
        record.mark(key("PS9"));
        record.store(
            key("PS9"),
            ToolResult::ok("fetch_part_live", json!({"ps_number": "PS9", "part_name": "Wheel", "qna": []})),
        );
        let categories = HashMap::from([(key("PS9"), Category::Dishwasher)]);
        apply_observations(&mut session, &[], &categories, &record);
        assert!(session.live_result(&key("PS9")).is_some());
    }

    #[test]
    fn test_narrow_clears_when_nothing_mentioned() {
        let mut session = Session::new("s", 10);
        session.reference(key("PS1"), Category::Refrigerator);
        session.reference(key("PS2"), Category::Refrigerator);
        narrow_to_mentioned(&mut session, &HashSet::from([key("PS2")]));
        assert_eq!(session.referenced_keys(), &[key("PS2")]);
        narrow_to_mentioned(&mut session, &HashSet::new());
        assert!(session.referenced_keys().is_empty());
        assert!(session.focus(Category::Refrigerator).unwrap().referenced_keys.is_empty());
    }
}
