//! 分类能力：从给定选项中选一个，选不出来就是 "unknown"
//!
//! 文本门控（AMBIGUOUS 时判断是否在范围内）与数据门控（推断缺失的家电类别）共用。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::session::Message;

pub const UNKNOWN: &str = "unknown";

#[async_trait]
pub trait Classifier: Send + Sync {
    /// 返回 options 中的一项，或 "unknown"
    async fn classify(&self, text: &str, options: &[&str]) -> String;
}

/// 基于 LLM 的分类器
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    /// 附加到 system prompt 的领域说明
    guidance: String,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            guidance: "You work for an appliance parts retailer that only supports refrigerator and dishwasher parts.".to_string(),
        }
    }

    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = guidance.into();
        self
    }
}

/// 把模型输出映射回选项：先整体精确匹配，再找唯一出现的选项（长的优先）
pub fn match_option(response: &str, options: &[&str]) -> Option<String> {
    let cleaned = response
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .to_lowercase();
    if let Some(hit) = options.iter().find(|o| o.eq_ignore_ascii_case(&cleaned)) {
        return Some(hit.to_string());
    }
    let mut by_len: Vec<&&str> = options.iter().collect();
    by_len.sort_by_key(|o| std::cmp::Reverse(o.len()));
    let mut found: Option<&str> = None;
    let mut rest = cleaned.clone();
    for option in by_len {
        let needle = option.to_lowercase();
        if rest.contains(&needle) {
            if found.is_some() {
                return None;
            }
            found = Some(option);
            rest = rest.replace(&needle, " ");
        }
    }
    found.map(str::to_string)
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &str, options: &[&str]) -> String {
        let system = format!(
            "{}\nClassify the user's text. Respond with exactly one of: {}. If none fits, respond with {}. Output the label only.",
            self.guidance,
            options.join(", "),
            UNKNOWN
        );
        let messages = vec![Message::system(system), Message::user(text)];
        match self.llm.complete(&messages).await {
            Ok(response) => match_option(&response, options).unwrap_or_else(|| {
                tracing::debug!(response = %crate::observability::preview(&response, 80), "classifier output matched no option");
                UNKNOWN.to_string()
            }),
            Err(e) => {
                tracing::warn!(error = %e, "classifier call failed");
                UNKNOWN.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_match_option() {
        let opts = ["in_scope", "out_of_scope"];
        assert_eq!(match_option(" \"IN_SCOPE\". ", &opts).as_deref(), Some("in_scope"));
        assert_eq!(match_option("OUT_OF_SCOPE - other appliance", &opts).as_deref(), Some("out_of_scope"));
        assert_eq!(match_option("maybe", &opts), None);

        let cats = ["refrigerator", "dishwasher", "washer", "dryer"];
        assert_eq!(match_option("dishwasher", &cats).as_deref(), Some("dishwasher"));
        assert_eq!(match_option("a dishwasher part", &cats).as_deref(), Some("dishwasher"));
        assert_eq!(match_option("washer or dryer", &cats), None);
    }

    #[tokio::test]
    async fn test_llm_failure_is_unknown() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_error("boom");
        llm.push("Microwave");
        let classifier = LlmClassifier::new(llm);
        let opts = ["refrigerator", "dishwasher"];
        assert_eq!(classifier.classify("turntable", &opts).await, UNKNOWN);
        assert_eq!(classifier.classify("turntable", &opts).await, UNKNOWN);
    }
}
