//! 有界执行循环：Deciding → Acting → Observing → … → Stopped
//!
//! 每次决策计一步，步数达到上限即以已有观察停止。取消只在等待决策时与两次调用之间生效，
//! 已发出的操作调用总会跑完。
//! 本轮内相同调用（操作名 + 参数）只执行一次，每条观察产生后交给回退编排器检查。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{RecoveryAction, RecoveryEngine};
use crate::fallback::{FallbackOrchestrator, FallbackRecord};
use crate::react::events::{send_event, LoopEvent};
use crate::react::{Controller, Decision, DecisionContext, Observation, ResultSource, ToolCall, ToolResult};
use crate::session::Session;
use crate::tools::{OperationCategory, OperationContext, OperationExecutor};

pub const DEFAULT_MAX_STEPS: usize = 8;
const OBSERVATION_RENDER_CHARS: usize = 1500;
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Deciding,
    Acting,
    Observing,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// 控制器判断观察已足够
    ControllerStopped,
    MaxIterations,
    Cancelled,
    /// 控制器不可用（LLM 调用失败）
    ControllerFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ControllerStopped => f.write_str("controller_stopped"),
            StopReason::MaxIterations => f.write_str("max_iterations"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::ControllerFailed(e) => write!(f, "controller_failed: {}", e),
        }
    }
}

/// 一轮执行的结果
#[derive(Debug)]
pub struct LoopOutcome {
    pub observations: Vec<Observation>,
    /// 实际发生的决策次数
    pub steps: usize,
    pub stop_reason: StopReason,
    /// 本轮回退记录，轮结束后用于写入会话缓存
    pub record: FallbackRecord,
}

/// 单轮内的可变状态
struct TurnState {
    observations: Vec<Observation>,
    record: FallbackRecord,
    seen: HashMap<String, ToolResult>,
}

pub struct ExecutionLoop {
    executor: Arc<OperationExecutor>,
    orchestrator: FallbackOrchestrator,
    controller: Arc<dyn Controller>,
    recovery: RecoveryEngine,
    max_steps: usize,
    history_messages: usize,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

fn enter(phase: LoopPhase, step: usize) {
    tracing::trace!(?phase, step, "loop phase");
}

impl ExecutionLoop {
    pub fn new(executor: Arc<OperationExecutor>, controller: Arc<dyn Controller>, max_steps: usize) -> Self {
        let orchestrator = FallbackOrchestrator::new(executor.registry());
        Self {
            executor,
            orchestrator,
            controller,
            recovery: RecoveryEngine::new(),
            max_steps: max_steps.max(1),
            history_messages: 6,
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_history_messages(mut self, n: usize) -> Self {
        self.history_messages = n;
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub async fn run(&self, query: &str, session: &Session, cancel: &CancellationToken) -> LoopOutcome {
        let ctx = OperationContext::with_session(session);
        let documentation = self.executor.registry().render_documentation();
        let session_context = session.format_context();
        let history = session.transcript.recent(self.history_messages).to_vec();

        let mut state = TurnState {
            observations: Vec::new(),
            record: FallbackRecord::new(),
            seen: HashMap::new(),
        };
        let mut correction: Option<String> = None;
        let mut steps = 0;

        let stop_reason = 'turn: loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if steps >= self.max_steps {
                tracing::warn!(steps, "execution loop hit max iterations");
                break StopReason::MaxIterations;
            }
            steps += 1;
            enter(LoopPhase::Deciding, steps);
            send_event(&self.event_tx, LoopEvent::StepUpdate { step: steps, max_steps: self.max_steps });
            send_event(&self.event_tx, LoopEvent::Deciding);

            let decision_ctx = DecisionContext {
                query: query.to_string(),
                session_context: session_context.clone(),
                history: history.clone(),
                observations: state
                    .observations
                    .iter()
                    .map(|o| o.render(OBSERVATION_RENDER_CHARS))
                    .collect(),
                documentation: documentation.clone(),
                step: steps,
                max_steps: self.max_steps,
                correction: correction.take(),
            };
            let decision = tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                d = self.controller.decide(&decision_ctx) => d,
            };

            let calls = match decision {
                Ok(Decision::Stop) => break StopReason::ControllerStopped,
                Ok(Decision::Invoke(calls)) => calls,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        tracing::warn!(error = %e, step = steps, "controller output unparseable, retrying");
                        send_event(&self.event_tx, LoopEvent::Recovery {
                            action: "RetryWithPrompt".to_string(),
                            detail: crate::observability::preview(&prompt, OBSERVATION_PREVIEW_CHARS),
                        });
                        correction = Some(prompt);
                        continue;
                    }
                    RecoveryAction::Stop => {
                        tracing::error!(error = %e, "controller failed");
                        send_event(&self.event_tx, LoopEvent::Recovery {
                            action: "Stop".to_string(),
                            detail: e.to_string(),
                        });
                        break StopReason::ControllerFailed(e.to_string());
                    }
                },
            };

            enter(LoopPhase::Acting, steps);
            for call in calls {
                if cancel.is_cancelled() {
                    break 'turn StopReason::Cancelled;
                }
                send_event(&self.event_tx, LoopEvent::OperationCall {
                    operation: call.operation.clone(),
                    arguments: call.arguments.clone(),
                });
                let result = self.dispatch(&call, &ctx, &mut state).await;

                enter(LoopPhase::Observing, steps);
                let observation = Observation { step: steps, call, result };
                self.emit_observation(&observation);
                let follow_up = self
                    .orchestrator
                    .intercept(&observation, &self.executor, &ctx, &mut state.record)
                    .await;
                state.observations.push(observation);
                if let Some(fallback) = follow_up {
                    if let Some(id) = fallback.call.arguments.as_object().and_then(|m| m.values().next()) {
                        send_event(&self.event_tx, LoopEvent::FallbackTriggered {
                            identifier: id.as_str().unwrap_or_default().to_string(),
                        });
                    }
                    self.emit_observation(&fallback);
                    state.observations.push(fallback);
                }
            }
        };

        enter(LoopPhase::Stopped, steps);
        tracing::info!(steps, reason = %stop_reason, observations = state.observations.len(), "execution loop stopped");
        send_event(&self.event_tx, LoopEvent::Stopped {
            reason: stop_reason.to_string(),
            steps,
        });
        LoopOutcome {
            observations: state.observations,
            steps,
            stop_reason,
            record: state.record,
        }
    }

    /// 执行一次调用：本轮重复调用复用结果；已有实时结果时由其作答；显式回退经编排器去重
    async fn dispatch(&self, call: &ToolCall, ctx: &OperationContext<'_>, state: &mut TurnState) -> ToolResult {
        let identity = call.identity();
        if let Some(previous) = state.seen.get(&identity) {
            tracing::debug!(operation = %call.operation, "duplicate call in turn, reusing result");
            return previous.clone().with_source(ResultSource::Deduplicated);
        }

        let result = match self.executor.registry().get_handler(&call.operation) {
            Some(op) => {
                if let Some(answered) = self
                    .orchestrator
                    .answer_from_live(op.as_ref(), call, &state.record, ctx.session)
                {
                    answered
                } else if op.category() == OperationCategory::Fallback {
                    self.orchestrator
                        .run_explicit(op.as_ref(), call, &self.executor, ctx, &mut state.record)
                        .await
                } else {
                    self.executor.execute(call, ctx).await
                }
            }
            // 未注册的操作由执行器报告 InvalidInput
            None => self.executor.execute(call, ctx).await,
        };
        state.seen.insert(identity, result.clone());
        result
    }

    fn emit_observation(&self, observation: &Observation) {
        send_event(&self.event_tx, LoopEvent::Observation {
            operation: observation.result.operation.clone(),
            ok: !observation.result.is_error(),
            preview: observation.render(OBSERVATION_PREVIEW_CHARS),
        });
    }
}
