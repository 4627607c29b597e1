//! 会话状态：焦点上下文、已引用配件、对话记录，以及按会话隔离的存储

pub mod state;
pub mod store;
pub mod transcript;
pub mod update;

pub use state::{Category, EntityKey, FocusContext, Session};
pub use store::SessionStore;
pub use transcript::{Message, Role, Transcript};
pub use update::{apply_observations, narrow_to_mentioned};
