//! 推理层：控制器决策、有界执行循环、观察与实体提取、回复生成

pub mod events;
pub mod loop_;
pub mod observation;
pub mod planner;
pub mod synthesizer;

pub use events::LoopEvent;
pub use loop_::{ExecutionLoop, LoopOutcome, LoopPhase, StopReason, DEFAULT_MAX_STEPS};
pub use observation::{extract_entities, EntityRef, Observation, ResultSource, ToolCall, ToolResult};
pub use planner::{parse_decision, Controller, Decision, DecisionContext, LlmController};
pub use synthesizer::{
    extract_mentioned_keys, honest_fallback_response, part_cards, GenerationRequest, LlmTextGenerator, PartCard,
    TextGenerator,
};
