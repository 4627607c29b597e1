//! 范围门控：查询文本门控（规则 + 分类器）与结果数据门控（实体类别）

pub mod classifier;
pub mod data_gate;
pub mod text_gate;

pub use classifier::{match_option, Classifier, LlmClassifier, UNKNOWN};
pub use data_gate::{data_rejection_message, DataGateDecision, DataScopeGate, OffendingEntity};
pub use text_gate::{text_rejection_message, ScopeRules, TextGateDecision, TextScopeGate, TextVerdict};
