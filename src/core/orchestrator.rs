//! 单轮编排：文本门控 → 执行循环 → 数据门控 → 回复生成 → 会话更新
//!
//! 会话作为值在各阶段之间传递：`process_turn` 接收会话并返回更新后的会话。
//! 取消的轮次不改动引用与对话记录，只保留已完成的实时抓取结果；
//! 被拒绝的轮次只记录对话并清除越界配件的引用。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::fallback::FallbackRecord;
use crate::react::{
    extract_mentioned_keys, honest_fallback_response, part_cards, ExecutionLoop, GenerationRequest, Observation,
    PartCard, StopReason, TextGenerator,
};
use crate::scope::{text_rejection_message, DataGateDecision, DataScopeGate, OffendingEntity, TextScopeGate};
use crate::session::{apply_observations, narrow_to_mentioned, EntityKey, Session, SessionStore};

const GENERATION_OBSERVATION_CHARS: usize = 3000;

/// 本轮结论
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", content = "offending", rename_all = "snake_case")]
pub enum TurnVerdict {
    Answered,
    RejectedByText,
    RejectedByData(Vec<OffendingEntity>),
    Cancelled,
}

/// 一轮处理的结果
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub verdict: TurnVerdict,
    pub response: String,
    pub observations: Vec<Observation>,
    /// 回复中提到的配件卡片
    pub parts: Vec<PartCard>,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl TurnOutcome {
    fn rejected(verdict: TurnVerdict, response: String) -> Self {
        Self {
            verdict,
            response,
            observations: Vec::new(),
            parts: Vec::new(),
            steps: 0,
            stop_reason: None,
        }
    }

    fn cancelled(observations: Vec<Observation>, steps: usize) -> Self {
        Self {
            verdict: TurnVerdict::Cancelled,
            response: String::new(),
            observations,
            parts: Vec::new(),
            steps,
            stop_reason: Some(StopReason::Cancelled),
        }
    }
}

pub struct Orchestrator {
    pub(crate) text_gate: TextScopeGate,
    pub(crate) data_gate: DataScopeGate,
    pub(crate) execution: ExecutionLoop,
    pub(crate) generator: Arc<dyn TextGenerator>,
    pub(crate) sessions: SessionStore,
    pub(crate) retain_mentioned_only: bool,
    pub(crate) history_messages: usize,
}

impl Orchestrator {
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// 以会话 ID 处理一轮：同一会话的轮次串行执行
    pub async fn handle(&self, conversation_id: &str, query: &str, cancel: &CancellationToken) -> TurnOutcome {
        let mut guard = self.sessions.checkout(conversation_id).await;
        let (updated, outcome) = self.process_turn(guard.clone(), query, cancel).await;
        *guard = updated;
        outcome
    }

    pub async fn process_turn(
        &self,
        session: Session,
        query: &str,
        cancel: &CancellationToken,
    ) -> (Session, TurnOutcome) {
        let query = query.trim();
        tracing::info!(conversation = %session.id, query = %crate::observability::preview(query, 120), "turn started");

        let text = tokio::select! {
            _ = cancel.cancelled() => None,
            d = self.text_gate.check(query, session.transcript.messages()) => Some(d),
        };
        let Some(text) = text else {
            return (session, TurnOutcome::cancelled(Vec::new(), 0));
        };
        if !text.allowed() {
            tracing::info!(conversation = %session.id, verdict = ?text.verdict, "query rejected by text gate");
            let response = text_rejection_message();
            let mut next = session;
            next.transcript.push_exchange(query, response.as_str());
            next.touch();
            return (next, TurnOutcome::rejected(TurnVerdict::RejectedByText, response));
        }

        let outcome = self.execution.run(query, &session, cancel).await;
        if outcome.stop_reason == StopReason::Cancelled {
            tracing::info!(conversation = %session.id, steps = outcome.steps, "turn cancelled");
            let kept = keep_live_results(session, &outcome.record);
            return (kept, TurnOutcome::cancelled(outcome.observations, outcome.steps));
        }

        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            d = self.data_gate.check(&outcome.observations) => Some(d),
        };
        let Some(decision) = decision else {
            let kept = keep_live_results(session, &outcome.record);
            return (kept, TurnOutcome::cancelled(outcome.observations, outcome.steps));
        };
        let categories = match decision {
            DataGateDecision::Reject { offending, message } => {
                let keys: Vec<EntityKey> = offending.iter().map(|o| o.key.clone()).collect();
                tracing::info!(conversation = %session.id, offending = ?keys, "turn rejected by data gate");
                let mut next = session;
                next.purge(&keys);
                next.transcript.push_exchange(query, message.as_str());
                return (
                    next,
                    TurnOutcome {
                        verdict: TurnVerdict::RejectedByData(offending),
                        response: message,
                        observations: outcome.observations,
                        parts: Vec::new(),
                        steps: outcome.steps,
                        stop_reason: Some(outcome.stop_reason),
                    },
                );
            }
            DataGateDecision::Pass { categories } => categories,
        };

        let mut next = session.clone();
        apply_observations(&mut next, &outcome.observations, &categories, &outcome.record);

        let all_failed = !outcome.observations.is_empty() && outcome.observations.iter().all(|o| o.result.is_error());
        let controller_failed = matches!(outcome.stop_reason, StopReason::ControllerFailed(_));
        let (response, generated) = if all_failed || (controller_failed && outcome.observations.is_empty()) {
            (honest_fallback_response(&outcome.observations), false)
        } else {
            let request = GenerationRequest {
                query: query.to_string(),
                session_context: next.format_context(),
                history: session.transcript.recent(self.history_messages).to_vec(),
                observations: outcome
                    .observations
                    .iter()
                    .map(|o| o.render(GENERATION_OBSERVATION_CHARS))
                    .collect(),
                entity_keys: next.referenced_keys().to_vec(),
            };
            let generated = tokio::select! {
                _ = cancel.cancelled() => None,
                g = self.generator.generate(&request) => Some(g),
            };
            match generated {
                None => {
                    let kept = keep_live_results(session, &outcome.record);
                    return (kept, TurnOutcome::cancelled(outcome.observations, outcome.steps));
                }
                Some(Ok(text)) => (text, true),
                Some(Err(e)) => {
                    tracing::warn!(conversation = %session.id, error = %e, "text generation failed, degrading");
                    (honest_fallback_response(&outcome.observations), false)
                }
            }
        };

        let mentioned: HashSet<EntityKey> = extract_mentioned_keys(&response);
        if generated && self.retain_mentioned_only {
            narrow_to_mentioned(&mut next, &mentioned);
        }
        let parts = part_cards(&outcome.observations, &mentioned);
        next.transcript.push_exchange(query, response.as_str());
        next.touch();

        tracing::info!(
            conversation = %next.id,
            steps = outcome.steps,
            observations = outcome.observations.len(),
            referenced = next.referenced_keys().len(),
            reason = %outcome.stop_reason,
            "turn answered"
        );
        (
            next,
            TurnOutcome {
                verdict: TurnVerdict::Answered,
                response,
                observations: outcome.observations,
                parts,
                steps: outcome.steps,
                stop_reason: Some(outcome.stop_reason),
            },
        )
    }
}

/// 取消时只把已完成的实时抓取写入缓存，下一轮无需重新抓取
fn keep_live_results(mut session: Session, record: &FallbackRecord) -> Session {
    let mut kept = 0usize;
    for (key, payload) in record.successes() {
        session.cache_live_result(key.clone(), payload.clone());
        kept += 1;
    }
    if kept > 0 {
        tracing::debug!(conversation = %session.id, kept, "kept live results from cancelled turn");
    }
    session
}
