//! 标识解析：把用户的各种写法规范成配件号
//!
//! 策略按固定优先级尝试，首个成功即返回：
//! 1. 会话指代（"this part" / "it"）→ 当前焦点中最近的配件号，置信度 session
//! 2. URL 中嵌入的配件号 → exact
//! 3. 裸配件号 `PS\d+` → exact
//! 4. 厂商件号精确匹配 → matched
//! 5. 厂商件号部分匹配：唯一候选 → fuzzy，多个 → 未解析并返回候选
//! 6. 文本搜索兜底 → 未解析，置信度 none，返回候选
//!
//! 第 2 步起每个策略都回到存储校验存在性，语法匹配本身不算解析成功。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::{ApplianceModel, Part, PartQuery, StoreError, StructuredStore};
use crate::session::{EntityKey, Session};

/// 解析置信度；比较时 Session > Exact > Matched > Fuzzy > None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Fuzzy,
    Matched,
    Exact,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedKind {
    Part,
    Model,
}

/// 候选项（配件或型号的精简信息）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appliance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_part_number: Option<String>,
}

impl From<&Part> for Candidate {
    fn from(p: &Part) -> Self {
        Self {
            key: p.ps_number.clone(),
            name: p.part_name.clone(),
            appliance_type: p.appliance_type.clone(),
            manufacturer_part_number: p.manufacturer_part_number.clone(),
        }
    }
}

impl From<&ApplianceModel> for Candidate {
    fn from(m: &ApplianceModel) -> Self {
        Self {
            key: m.model_number.clone(),
            name: m.description.clone().unwrap_or_default(),
            appliance_type: m.appliance_type.clone(),
            manufacturer_part_number: None,
        }
    }
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub resolved: bool,
    pub kind: ResolvedKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub message: String,
}

impl ResolutionOutcome {
    fn part(part: &Part, confidence: Confidence, message: impl Into<String>) -> Self {
        Self {
            resolved: true,
            kind: ResolvedKind::Part,
            key: Some(part.ps_number.clone()),
            confidence,
            candidates: None,
            name: Some(part.part_name.clone()),
            category: part.appliance_type.clone(),
            message: message.into(),
        }
    }

    fn model(model: &ApplianceModel, confidence: Confidence, message: impl Into<String>) -> Self {
        Self {
            resolved: true,
            kind: ResolvedKind::Model,
            key: Some(model.model_number.clone()),
            confidence,
            candidates: None,
            name: model.description.clone(),
            category: model.appliance_type.clone(),
            message: message.into(),
        }
    }

    fn unresolved(kind: ResolvedKind, candidates: Vec<Candidate>, message: impl Into<String>) -> Self {
        Self {
            resolved: false,
            kind,
            key: None,
            confidence: Confidence::None,
            candidates: if candidates.is_empty() { None } else { Some(candidates) },
            name: None,
            category: None,
            message: message.into(),
        }
    }

    pub fn entity_key(&self) -> Option<EntityKey> {
        match self.kind {
            ResolvedKind::Part if self.resolved => self.key.as_deref().and_then(EntityKey::parse),
            _ => None,
        }
    }
}

const SESSION_PHRASES: [&str; 6] = ["this part", "the part", "that part", "this one", "that one", "it"];
const TEXT_SEARCH_LIMIT: usize = 5;

fn session_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = SESSION_PHRASES
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("static regex")
    })
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)partselect\.com/(PS\d+)").expect("static regex"))
}

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(PS\d{3,})\b").expect("static regex"))
}

fn manufacturer_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z0-9-]{5,})\b").expect("static regex"))
}

/// 像厂商件号的词：至少 5 位、含数字、不是配件号
fn manufacturer_code(input: &str) -> Option<String> {
    manufacturer_code_re()
        .captures_iter(input)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|w| w.chars().any(|c| c.is_ascii_digit()) && !w.to_uppercase().starts_with("PS"))
        .map(str::to_uppercase)
}

/// 标识解析器
pub struct IdentifierResolver {
    store: Arc<dyn StructuredStore>,
}

impl IdentifierResolver {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }

    /// 解析配件引用；存储故障向上传递
    pub async fn resolve_part(
        &self,
        input: &str,
        session: Option<&Session>,
    ) -> Result<ResolutionOutcome, StoreError> {
        let input = input.trim();

        // 1. 会话指代：会话里没有配件号时落到后续策略
        if let Some(session) = session {
            if session_phrase_re().is_match(input) {
                if let Some(key) = session.most_recent_key() {
                    tracing::debug!(identifier = %key, "resolved from session reference");
                    let message = format!("\"{}\" refers to {}", input, key);
                    // 名称与类别随结果带出，数据门控据此判定而无需再分类
                    if let Some(part) = self.store.get_part(key.as_str()).await? {
                        return Ok(ResolutionOutcome::part(&part, Confidence::Session, message));
                    }
                    // 仅经实时抓取得到的配件不在目录里：名称取自实时缓存，类别取自会话焦点
                    return Ok(ResolutionOutcome {
                        resolved: true,
                        kind: ResolvedKind::Part,
                        key: Some(key.to_string()),
                        confidence: Confidence::Session,
                        candidates: None,
                        name: session
                            .live_result(key)
                            .and_then(|live| live.get("part_name"))
                            .and_then(|name| name.as_str())
                            .map(str::to_string),
                        category: session.category_of(key).map(|c| c.as_str().to_string()),
                        message,
                    });
                }
            }
        }

        // 2. URL；3. 裸配件号
        let embedded = url_re()
            .captures(input)
            .map(|c| (c[1].to_uppercase(), "URL"))
            .or_else(|| code_re().captures(input).map(|c| (c[1].to_uppercase(), "part number")));
        if let Some((code, source)) = embedded {
            return Ok(match self.store.get_part(&code).await? {
                Some(part) => ResolutionOutcome::part(&part, Confidence::Exact, format!("{} matched by {}", code, source)),
                None => ResolutionOutcome::unresolved(
                    ResolvedKind::Part,
                    Vec::new(),
                    format!("{} is not in the catalog", code),
                ),
            });
        }

        // 4. 厂商件号精确；5. 部分匹配
        if let Some(code) = manufacturer_code(input) {
            if let Some(part) = self.store.find_by_manufacturer_number(&code).await? {
                return Ok(ResolutionOutcome::part(
                    &part,
                    Confidence::Matched,
                    format!("manufacturer number {} matched {}", code, part.ps_number),
                ));
            }
            let partial = self.store.find_by_manufacturer_number_partial(&code).await?;
            match partial.as_slice() {
                [] => {}
                [only] => {
                    return Ok(ResolutionOutcome::part(
                        only,
                        Confidence::Fuzzy,
                        format!("manufacturer number {} partially matched {}", code, only.ps_number),
                    ))
                }
                many => {
                    return Ok(ResolutionOutcome::unresolved(
                        ResolvedKind::Part,
                        many.iter().map(Candidate::from).collect(),
                        format!("{} matches {} parts; ask which one", code, many.len()),
                    ))
                }
            }
        }

        // 6. 文本搜索兜底
        let hits = self
            .store
            .search_parts(&PartQuery {
                query: Some(input.to_string()),
                limit: Some(TEXT_SEARCH_LIMIT),
                ..Default::default()
            })
            .await?;
        let message = if hits.is_empty() {
            format!("no part matches \"{}\"", input)
        } else {
            format!("{} possible parts for \"{}\"", hits.len(), input)
        };
        Ok(ResolutionOutcome::unresolved(
            ResolvedKind::Part,
            hits.iter().map(Candidate::from).collect(),
            message,
        ))
    }

    /// 解析型号：精确 → 模糊（唯一候选才算解析）
    pub async fn resolve_model(&self, input: &str) -> Result<ResolutionOutcome, StoreError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(ResolutionOutcome::unresolved(ResolvedKind::Model, Vec::new(), "empty model number"));
        }
        if let Some(model) = self.store.get_model(input).await? {
            return Ok(ResolutionOutcome::model(
                &model,
                Confidence::Exact,
                format!("model {} found", model.model_number),
            ));
        }
        let fuzzy = self.store.find_models_fuzzy(input).await?;
        Ok(match fuzzy.as_slice() {
            [] => ResolutionOutcome::unresolved(
                ResolvedKind::Model,
                Vec::new(),
                format!("model {} is not in the catalog", input),
            ),
            [only] => ResolutionOutcome::model(
                only,
                Confidence::Fuzzy,
                format!("{} closest model is {}", input, only.model_number),
            ),
            many => ResolutionOutcome::unresolved(
                ResolvedKind::Model,
                many.iter().map(Candidate::from).collect(),
                format!("{} matches {} models; ask which one", input, many.len()),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Category;
    use crate::store::memory::fixtures::sample_snapshot;
    use crate::store::MemoryCatalog;

    fn resolver() -> IdentifierResolver {
        IdentifierResolver::new(Arc::new(MemoryCatalog::new(sample_snapshot())))
    }

    fn session_with(key: &str) -> Session {
        let mut session = Session::new("s", 10);
        session.reference(EntityKey::parse(key).unwrap(), Category::Refrigerator);
        session
    }

    #[tokio::test]
    async fn test_session_phrase_wins_over_code_shape() {
        let session = session_with("PS11739119");
        let out = resolver()
            .resolve_part("is this part the same as PS11752778?", Some(&session))
            .await
            .unwrap();
        assert!(out.resolved);
        assert_eq!(out.confidence, Confidence::Session);
        assert_eq!(out.key.as_deref(), Some("PS11739119"));
    }

    #[tokio::test]
    async fn test_session_reference_carries_name_and_category() {
        let session = session_with("PS11739119");
        let out = resolver().resolve_part("this part", Some(&session)).await.unwrap();
        assert_eq!(out.confidence, Confidence::Session);
        assert_eq!(out.name.as_deref(), Some("Ice Maker Assembly"));
        assert_eq!(out.category.as_deref(), Some("refrigerator"));

        // 目录外的配件（实时抓取得到）：类别取自引用它的焦点
        let mut live_only = Session::new("s", 10);
        let live_key = EntityKey::parse("PS55555555").unwrap();
        live_only.reference(live_key.clone(), Category::Dishwasher);
        let out = resolver().resolve_part("that one", Some(&live_only)).await.unwrap();
        assert!(out.resolved);
        assert_eq!(out.key.as_deref(), Some("PS55555555"));
        assert!(out.name.is_none());
        assert_eq!(out.category.as_deref(), Some("dishwasher"));

        live_only.cache_live_result(live_key, serde_json::json!({"ps_number": "PS55555555", "part_name": "Spray Arm"}));
        let out = resolver().resolve_part("that one", Some(&live_only)).await.unwrap();
        assert_eq!(out.name.as_deref(), Some("Spray Arm"));
    }

    #[tokio::test]
    async fn test_session_phrase_without_session_falls_through() {
        let out = resolver().resolve_part("this part", None).await.unwrap();
        assert!(!out.resolved);
        assert_eq!(out.confidence, Confidence::None);

        let empty = Session::new("s", 10);
        let out = resolver()
            .resolve_part("does it fit PS11752778", Some(&empty))
            .await
            .unwrap();
        assert_eq!(out.confidence, Confidence::Exact);
    }

    #[tokio::test]
    async fn test_url_and_code_are_validated() {
        let r = resolver();
        let url = r
            .resolve_part("https://www.partselect.com/PS11752778-Whirlpool-Bin.htm", None)
            .await
            .unwrap();
        assert_eq!(url.confidence, Confidence::Exact);
        assert_eq!(url.category.as_deref(), Some("refrigerator"));

        let missing = r.resolve_part("PS00000001", None).await.unwrap();
        assert!(!missing.resolved);
        assert!(missing.key.is_none());
        assert!(missing.entity_key().is_none());
    }

    #[tokio::test]
    async fn test_manufacturer_exact_and_partial() {
        let r = resolver();
        let exact = r.resolve_part("part WPW10321304", None).await.unwrap();
        assert_eq!(exact.confidence, Confidence::Matched);
        assert_eq!(exact.key.as_deref(), Some("PS11752778"));

        let fuzzy = r.resolve_part("W1019", None).await.unwrap();
        assert_eq!(fuzzy.confidence, Confidence::Fuzzy);
        assert_eq!(fuzzy.key.as_deref(), Some("PS11739119"));

        let single = r.resolve_part("W10350", None).await.unwrap();
        assert_eq!(single.key.as_deref(), Some("PS10065979"));
    }

    #[tokio::test]
    async fn test_partial_match_with_many_candidates_is_not_guessed() {
        let mut snapshot = sample_snapshot();
        for (ps, mpn) in [("PS3000001", "W10300001"), ("PS3000002", "W10300002")] {
            snapshot.parts.push(Part {
                ps_number: ps.to_string(),
                part_name: "Drain Hose".to_string(),
                manufacturer_part_number: Some(mpn.to_string()),
                ..Default::default()
            });
        }
        let r = IdentifierResolver::new(Arc::new(MemoryCatalog::new(snapshot)));
        let out = r.resolve_part("W10300", None).await.unwrap();
        assert!(!out.resolved);
        assert!(out.key.is_none());
        assert_eq!(out.candidates.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_free_text_fallback_never_resolves() {
        let out = resolver().resolve_part("ice maker", None).await.unwrap();
        assert!(!out.resolved);
        assert_eq!(out.confidence, Confidence::None);
        let candidates = out.candidates.unwrap();
        assert_eq!(candidates[0].key, "PS11739119");
    }

    #[tokio::test]
    async fn test_resolve_model() {
        let r = resolver();
        assert_eq!(r.resolve_model("wdt780saem1").await.unwrap().confidence, Confidence::Exact);
        let many = r.resolve_model("WRS325").await.unwrap();
        assert!(!many.resolved);
        assert_eq!(many.candidates.unwrap().len(), 2);
        assert!(!r.resolve_model("ZZZ999").await.unwrap().resolved);
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Session > Confidence::Exact);
        assert!(Confidence::Exact > Confidence::Matched);
        assert!(Confidence::Matched > Confidence::Fuzzy);
        assert!(Confidence::Fuzzy > Confidence::None);
    }
}
