//! 第一道范围门控：只看查询文本与最近对话
//!
//! 先匹配纳入规则（任一命中即 IN_SCOPE），再匹配排除规则（任一命中即 OUT_OF_SCOPE），
//! 都不命中为 AMBIGUOUS，交给分类器裁决且不再复核。纳入必须先于排除：
//! "dishwasher" 里含有 "washer" 这类子串冲突只能靠顺序化解。配件号形状永远是纳入规则。

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::core::AgentError;
use crate::scope::Classifier;
use crate::session::{Message, Role};

/// 配件号形状：类别要到第二道门控才知道，这里一律放行
const PART_NUMBER_PATTERN: &str = r"\bps\d+\b";

const DEFAULT_INCLUSION: &[&str] = &[
    r"\brefrigerator\b",
    r"\bfridge\b",
    r"\bdishwasher\b",
    r"\bfreezer\b",
    r"\bice\s*maker\b",
    r"\bpart\s*(number|#)?\b",
    r"\bcompatib(le|ility)\b",
    r"\binstall(ation)?\b",
    r"\breplace(ment)?\b",
    r"\bwater\s*filter\b",
    r"\bdoor\s*(bin|shelf|gasket)\b",
    r"\bcompressor\b",
    r"\bthermostat\b",
    r"\bdefrost\b",
    r"\bdrain\s*(pump|hose)\b",
    r"\bspray\s*arm\b",
    r"\brack\b",
    r"\bleaking\b",
    r"\bnot\s*(cooling|freezing|working|draining)\b",
    r"\bnoisy\b",
    r"\bwon'?t\s*(start|run|drain)\b",
    r"\bwhirlpool\b",
    r"\bge\b",
    r"\bsamsung\b",
    r"\blg\b",
    r"\bkitchenaid\b",
    r"\bmaytag\b",
    r"\bfrigidaire\b",
    r"\bbosch\b",
    r"\bkenmore\b",
];

const DEFAULT_EXCLUSION: &[&str] = &[
    r"\bwashing\s*machine\b",
    r"\bwasher\b",
    r"\bdryer\b",
    r"\boven\b",
    r"\bstove\b",
    r"\bmicrowave\b",
    r"\bair\s*condition(er|ing)?\b",
    r"\bhvac\b",
    r"\bweather\b",
    r"\bnews\b",
    r"\bsports\b",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextVerdict {
    InScope,
    OutOfScope,
    Ambiguous,
}

/// 纳入 / 排除规则（大小写不敏感）
pub struct ScopeRules {
    inclusion: Vec<Regex>,
    exclusion: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, AgentError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| AgentError::ConfigError(format!("bad scope pattern {}: {}", p, e)))
        })
        .collect()
}

impl ScopeRules {
    /// 配件号形状总是排在纳入规则第一位
    pub fn new(inclusion: &[&str], exclusion: &[&str]) -> Result<Self, AgentError> {
        let mut with_code = vec![PART_NUMBER_PATTERN];
        with_code.extend_from_slice(inclusion);
        Ok(Self {
            inclusion: compile(&with_code)?,
            exclusion: compile(exclusion)?,
        })
    }

    pub fn evaluate(&self, query: &str) -> TextVerdict {
        if self.inclusion.iter().any(|r| r.is_match(query)) {
            TextVerdict::InScope
        } else if self.exclusion.iter().any(|r| r.is_match(query)) {
            TextVerdict::OutOfScope
        } else {
            TextVerdict::Ambiguous
        }
    }
}

impl Default for ScopeRules {
    fn default() -> Self {
        // 内置规则是常量，编译失败只可能是代码错误
        Self::new(DEFAULT_INCLUSION, DEFAULT_EXCLUSION).expect("built-in scope patterns")
    }
}

/// 第一道门控的裁决结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextGateDecision {
    pub verdict: TextVerdict,
    /// 是否经过分类器
    pub classified: bool,
}

impl TextGateDecision {
    pub fn allowed(&self) -> bool {
        self.verdict == TextVerdict::InScope
    }
}

pub struct TextScopeGate {
    rules: ScopeRules,
    classifier: Arc<dyn Classifier>,
    history_messages: usize,
}

const IN_SCOPE_LABEL: &str = "in_scope";
const OUT_OF_SCOPE_LABEL: &str = "out_of_scope";

impl TextScopeGate {
    pub fn new(rules: ScopeRules, classifier: Arc<dyn Classifier>, history_messages: usize) -> Self {
        Self {
            rules,
            classifier,
            history_messages,
        }
    }

    /// 规则裁决；AMBIGUOUS 时分类器的结论即最终结论（"unknown" 视为越界）
    pub async fn check(&self, query: &str, history: &[Message]) -> TextGateDecision {
        let verdict = self.rules.evaluate(query);
        if verdict != TextVerdict::Ambiguous {
            tracing::debug!(?verdict, "scope rules matched");
            return TextGateDecision {
                verdict,
                classified: false,
            };
        }

        let text = classifier_text(query, history, self.history_messages);
        let label = self
            .classifier
            .classify(&text, &[IN_SCOPE_LABEL, OUT_OF_SCOPE_LABEL])
            .await;
        let verdict = match label.as_str() {
            IN_SCOPE_LABEL => TextVerdict::InScope,
            // out_of_scope 与 unknown
            _ => TextVerdict::OutOfScope,
        };
        tracing::info!(?verdict, label = %label, "ambiguous query classified");
        TextGateDecision {
            verdict,
            classified: true,
        }
    }
}

const HISTORY_SNIPPET_CHARS: usize = 500;

fn classifier_text(query: &str, history: &[Message], n: usize) -> String {
    let start = history.len().saturating_sub(n);
    let recent = &history[start..];
    let mut text = String::from(
        "Is this query about refrigerator or dishwasher parts, repairs, symptoms, installation, part numbers, model numbers or compatibility? \
A follow-up to an earlier refrigerator or dishwasher conversation is in scope even if it does not name the appliance.\n",
    );
    if !recent.is_empty() {
        text.push_str("\nRecent conversation:\n");
        for m in recent {
            let who = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            text.push_str(&format!(
                "{}: {}\n",
                who,
                crate::observability::preview(&m.content, HISTORY_SNIPPET_CHARS)
            ));
        }
    }
    text.push_str(&format!("\nCurrent query: {}", query));
    text
}

/// 第一道门控的拒绝说明
pub fn text_rejection_message() -> String {
    "I'm sorry, but I can only help with refrigerator and dishwasher parts and repairs.\n\n\
I can assist you with:\n\
- Finding parts for your refrigerator or dishwasher\n\
- Checking part compatibility with your model\n\
- Troubleshooting refrigerator or dishwasher issues\n\
- Installation guidance for parts\n\n\
Is there anything related to refrigerators or dishwashers I can help you with?"
        .to_string()
}
