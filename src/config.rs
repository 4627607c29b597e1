//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PARTS__*` 覆盖（双下划线表示嵌套，如 `PARTS__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub scope: ScopeSection,
    pub fallback: FallbackSection,
}

/// [app] 段：目录数据来源、会话窗口与过期
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// JSON 目录快照（MemoryCatalog）
    pub catalog_path: Option<PathBuf>,
    /// SQLite 目录（设置后优先于 catalog_path 作为结构化存储）
    pub sqlite_path: Option<PathBuf>,
    /// 会话 transcript 保留的消息条数
    #[serde(default = "default_max_transcript_messages")]
    pub max_transcript_messages: usize,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// 回复生成后仅保留回复中提到的配件号
    #[serde(default = "default_true")]
    pub retain_mentioned_only: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            catalog_path: None,
            sqlite_path: None,
            max_transcript_messages: default_max_transcript_messages(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            retain_mentioned_only: true,
        }
    }
}

fn default_max_transcript_messages() -> usize {
    10
}

fn default_session_idle_timeout_secs() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 分类用的小模型，未设置时与 model 相同
    pub classifier_model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            classifier_model: None,
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：执行循环上限与普通操作超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// resolution / lookup / search 单次调用超时（秒）
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
    /// UpstreamUnavailable 重试前的等待（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 交给控制器的近期对话条数
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            history_messages: default_history_messages(),
        }
    }
}

fn default_max_iterations() -> usize {
    8
}

fn default_lookup_timeout_secs() -> u64 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_history_messages() -> usize {
    6
}

/// [scope] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ScopeSection {
    /// 文本门控交给分类器的近期对话条数
    #[serde(default = "default_classifier_history_messages")]
    pub classifier_history_messages: usize,
}

impl Default for ScopeSection {
    fn default() -> Self {
        Self {
            classifier_history_messages: default_classifier_history_messages(),
        }
    }
}

fn default_classifier_history_messages() -> usize {
    4
}

/// [fallback] 段：实时抓取的开关、超时与并发许可
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fallback_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 排队等待许可的上限（秒），超出返回 Overloaded
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_fallback_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            queue_timeout_secs: default_queue_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

fn default_fallback_timeout_secs() -> u64 {
    45
}

fn default_max_concurrent() -> usize {
    2
}

fn default_queue_timeout_secs() -> u64 {
    10
}

fn default_base_url() -> String {
    "https://www.partselect.com/".to_string()
}

/// 从 config 目录加载配置，环境变量 PARTS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PARTS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PARTS")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
