//! 会话状态：按家电类别的焦点上下文、有序的已引用配件号、transcript 与实时抓取缓存
//!
//! 不变式：`referenced_keys` 中的每个配件号都出现在某个 `FocusContext.referenced_keys` 中；
//! `purge` / `retain_keys` 同时作用于两处结构。

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Transcript;

/// 受支持的家电类别（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Refrigerator,
    Dishwasher,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Refrigerator, Category::Dishwasher];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Refrigerator => "refrigerator",
            Category::Dishwasher => "dishwasher",
        }
    }

    /// 宽松解析（大小写、首尾空白、常见别名）
    pub fn parse(raw: &str) -> Option<Category> {
        match raw.trim().to_lowercase().as_str() {
            // 冷冻柜配件归入冰箱类别
            "refrigerator" | "fridge" | "refrigerators" | "freezer" | "freezers" => Some(Category::Refrigerator),
            "dishwasher" | "dishwashers" => Some(Category::Dishwasher),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn key_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^PS\d+$").expect("static regex"))
}

/// 规范配件号（`PS` + 数字，大写）
///
/// 只由标识解析器与操作结果产生；`parse` 只接受规范形状。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn parse(raw: &str) -> Option<EntityKey> {
        let upper = raw.trim().to_uppercase();
        key_shape().is_match(&upper).then_some(EntityKey(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单个家电类别下的对话焦点
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusContext {
    pub model_number: Option<String>,
    pub brand: Option<String>,
    pub current_symptom: Option<String>,
    /// 该类别下引用过的配件号，最近的在最后
    pub referenced_keys: Vec<EntityKey>,
}

/// 一次对话的持久上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub focus: BTreeMap<Category, FocusContext>,
    pub active_focus: Option<Category>,
    /// 跨类别的已引用配件号（有序集合，最近的在最后）
    referenced_keys: Vec<EntityKey>,
    pub transcript: Transcript,
    /// 实时抓取成功的结果，后续轮次的子集合请求直接从这里回答
    live_results: BTreeMap<EntityKey, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, max_transcript_messages: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            focus: BTreeMap::new(),
            active_focus: None,
            referenced_keys: Vec::new(),
            transcript: Transcript::new(max_transcript_messages),
            live_results: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn referenced_keys(&self) -> &[EntityKey] {
        &self.referenced_keys
    }

    pub fn focus(&self, category: Category) -> Option<&FocusContext> {
        self.focus.get(&category)
    }

    pub fn focus_mut(&mut self, category: Category) -> &mut FocusContext {
        self.focus.entry(category).or_default()
    }

    /// 记录一次引用：已存在则移到末尾，两处结构同步
    pub fn reference(&mut self, key: EntityKey, category: Category) {
        let ctx = self.focus.entry(category).or_default();
        ctx.referenced_keys.retain(|k| k != &key);
        ctx.referenced_keys.push(key.clone());

        self.referenced_keys.retain(|k| k != &key);
        self.referenced_keys.push(key);
        self.touch();
    }

    /// 从全局列表与所有焦点上下文中移除，并丢弃对应的实时抓取缓存
    pub fn purge(&mut self, keys: &[EntityKey]) {
        if keys.is_empty() {
            return;
        }
        let doomed: HashSet<&EntityKey> = keys.iter().collect();
        self.referenced_keys.retain(|k| !doomed.contains(k));
        for ctx in self.focus.values_mut() {
            ctx.referenced_keys.retain(|k| !doomed.contains(k));
        }
        self.live_results.retain(|k, _| !doomed.contains(k));
        self.touch();
    }

    /// 只保留 keep 中的配件号（回复后收窄）；keep 为空时清空
    pub fn retain_keys(&mut self, keep: &HashSet<EntityKey>) {
        self.referenced_keys.retain(|k| keep.contains(k));
        for ctx in self.focus.values_mut() {
            ctx.referenced_keys.retain(|k| keep.contains(k));
        }
        self.touch();
    }

    /// 指代解析用：当前焦点类别中最近的配件号，无焦点时取全局最近
    pub fn most_recent_key(&self) -> Option<&EntityKey> {
        self.active_focus
            .and_then(|c| self.focus.get(&c))
            .and_then(|ctx| ctx.referenced_keys.last())
            .or_else(|| self.referenced_keys.last())
    }

    /// 配件号被引用时所在的类别，活动焦点优先
    pub fn category_of(&self, key: &EntityKey) -> Option<Category> {
        self.active_focus
            .filter(|c| self.focus.get(c).is_some_and(|ctx| ctx.referenced_keys.contains(key)))
            .or_else(|| {
                self.focus
                    .iter()
                    .find(|(_, ctx)| ctx.referenced_keys.contains(key))
                    .map(|(c, _)| *c)
            })
    }

    pub fn set_active_focus(&mut self, category: Category) {
        self.active_focus = Some(category);
        self.focus.entry(category).or_default();
    }

    pub fn cache_live_result(&mut self, key: EntityKey, payload: Value) {
        self.live_results.insert(key, payload);
    }

    pub fn live_result(&self, key: &EntityKey) -> Option<&Value> {
        self.live_results.get(key)
    }

    /// 每个全局配件号都能在某个焦点上下文中找到
    pub fn is_consistent(&self) -> bool {
        self.referenced_keys.iter().all(|k| {
            self.focus
                .values()
                .any(|ctx| ctx.referenced_keys.contains(k))
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 供控制器与回复生成使用的上下文摘要
    pub fn format_context(&self) -> String {
        let mut lines = Vec::new();
        if let Some(active) = self.active_focus {
            lines.push(format!("Current appliance: {}", active));
        }
        for (category, ctx) in &self.focus {
            let mut parts = Vec::new();
            if let Some(ref m) = ctx.model_number {
                parts.push(format!("model {}", m));
            }
            if let Some(ref b) = ctx.brand {
                parts.push(format!("brand {}", b));
            }
            if let Some(ref s) = ctx.current_symptom {
                parts.push(format!("symptom \"{}\"", s));
            }
            if !ctx.referenced_keys.is_empty() {
                let keys: Vec<&str> = ctx.referenced_keys.iter().map(|k| k.as_str()).collect();
                parts.push(format!("parts discussed {}", keys.join(", ")));
            }
            if !parts.is_empty() {
                lines.push(format!("{}: {}", category, parts.join("; ")));
            }
        }
        if let Some(last) = self.most_recent_key() {
            lines.push(format!("Most recent part (\"this part\"): {}", last));
        }
        if !self.live_results.is_empty() {
            let keys: Vec<&str> = self.live_results.keys().map(|k| k.as_str()).collect();
            lines.push(format!("Live-fetched parts available: {}", keys.join(", ")));
        }
        if lines.is_empty() {
            "No prior context.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> EntityKey {
        EntityKey::parse(s).unwrap()
    }

    #[test]
    fn test_entity_key_shape() {
        assert_eq!(key(" ps123 ").as_str(), "PS123");
        assert!(EntityKey::parse("WPW10321304").is_none());
        assert!(EntityKey::parse("PS").is_none());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(Category::parse(" Fridge "), Some(Category::Refrigerator));
        assert_eq!(Category::parse("DISHWASHER"), Some(Category::Dishwasher));
        assert_eq!(Category::parse("Freezer"), Some(Category::Refrigerator));
        assert_eq!(Category::parse("microwave"), None);
    }

    #[test]
    fn test_reference_moves_to_end() {
        let mut s = Session::new("s", 10);
        s.reference(key("PS1"), Category::Refrigerator);
        s.reference(key("PS2"), Category::Dishwasher);
        s.reference(key("PS1"), Category::Refrigerator);
        assert_eq!(s.referenced_keys(), &[key("PS2"), key("PS1")]);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_purge_keeps_relative_order() {
        let mut s = Session::new("s", 10);
        s.reference(key("PS1"), Category::Refrigerator);
        s.reference(key("PS9"), Category::Refrigerator);
        s.reference(key("PS2"), Category::Refrigerator);
        s.cache_live_result(key("PS9"), serde_json::json!({"ps_number": "PS9"}));

        s.purge(&[key("PS9")]);

        assert_eq!(s.referenced_keys(), &[key("PS1"), key("PS2")]);
        assert_eq!(
            s.focus(Category::Refrigerator).unwrap().referenced_keys,
            vec![key("PS1"), key("PS2")]
        );
        assert!(s.live_result(&key("PS9")).is_none());
        assert!(s.is_consistent());
    }

    #[test]
    fn test_most_recent_prefers_active_focus() {
        let mut s = Session::new("s", 10);
        s.reference(key("PS1"), Category::Refrigerator);
        s.reference(key("PS2"), Category::Dishwasher);
        assert_eq!(s.most_recent_key(), Some(&key("PS2")));
        s.set_active_focus(Category::Refrigerator);
        assert_eq!(s.most_recent_key(), Some(&key("PS1")));
    }

    #[test]
    fn test_category_of_follows_focus() {
        let mut s = Session::new("s", 10);
        s.reference(key("PS1"), Category::Refrigerator);
        s.reference(key("PS2"), Category::Dishwasher);
        assert_eq!(s.category_of(&key("PS1")), Some(Category::Refrigerator));
        assert_eq!(s.category_of(&key("PS2")), Some(Category::Dishwasher));
        assert_eq!(s.category_of(&key("PS3")), None);
    }

    #[test]
    fn test_retain_keys_empty_clears() {
        let mut s = Session::new("s", 10);
        s.reference(key("PS1"), Category::Refrigerator);
        s.retain_keys(&HashSet::new());
        assert!(s.referenced_keys().is_empty());
        assert!(s.focus(Category::Refrigerator).unwrap().referenced_keys.is_empty());
    }
}
