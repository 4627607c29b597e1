//! Parts Agent - 冰箱 / 洗碗机配件客服的工具编排流水线
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、构建器、单轮编排
//! - **scope**: 两道范围门控（查询文本 / 结果数据）
//! - **resolver**: 标识解析优先级链
//! - **tools**: 操作注册表、执行器与数据操作
//! - **react**: 控制器、有界执行循环、回复生成
//! - **fallback**: 实时抓取回退（每轮每个配件号至多一次）
//! - **session**: 会话状态、对话记录与会话存储
//! - **store**: 配件目录（内存 / SQLite）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod config;
pub mod core;
pub mod fallback;
pub mod llm;
pub mod observability;
pub mod react;
pub mod resolver;
pub mod scope;
pub mod session;
pub mod store;
pub mod tools;
