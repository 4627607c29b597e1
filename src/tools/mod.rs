//! 操作箱：注册表、执行器、决策 Schema，以及四类数据操作（resolution / lookup / search / fallback）

pub mod executor;
pub mod fallback;
pub mod lookup;
pub mod registry;
pub mod resolution;
pub mod schema;
pub mod search;

pub use executor::OperationExecutor;
pub use fallback::FetchPartLiveOp;
pub use lookup::{
    CheckCompatibilityOp, GetCompatibleModelsOp, GetCompatiblePartsOp, GetPartOp, GetRepairInstructionsOp,
    GetSymptomsOp,
};
pub use registry::{Operation, OperationCategory, OperationContext, OperationMetadata, OperationRegistry};
pub use resolution::{ResolveModelOp, ResolvePartOp};
pub use schema::decision_schema_json;
pub use search::{
    ScopedContentSearch, SearchPartsOp, SearchPartsSemanticOp, SearchQnaOp, SearchRepairStoriesOp, SearchReviewsOp,
};
