//! 核心编排层：错误与恢复、回退并发许可、流水线构建与单轮编排

pub mod admission;
pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;

pub use admission::FallbackAdmission;
pub use builder::{bootstrap_registry, AgentBuilder};
pub use error::{AgentError, ErrorKind, OpError, RecoveryAction, StoreError};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnVerdict};
pub use recovery::RecoveryEngine;
