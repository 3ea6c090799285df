//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CADENCE__*` 覆盖（双下划线表示嵌套，如 `CADENCE__AGENT__MAX_ITERATIONS=3`）。
//! AppConfig 只在启动时加载一次，随后转换为各组件的运行时配置值传入构造函数。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::orchestrator::{OrchestratorConfig, PhaseTimeouts};
use crate::core::retry::RetryPolicy;
use crate::memory::{MemoryConfig, RelevanceConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
    pub session: SessionSection,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 日志过滤（RUST_LOG 优先）
    pub log_level: Option<String>,
}

/// [llm] 段：后端选择、模型与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；有 Key 时才会真正使用远端
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub enabled: bool,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "text-embedding-3-small".to_string(),
            base_url: None,
        }
    }
}

/// [agent] 段：迭代上限、上下文窗口与各阶段超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    /// 0 表示不开窗
    pub context_window_turns: usize,
    pub timeouts: PhaseTimeoutsSection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            context_window_turns: 6,
            timeouts: PhaseTimeoutsSection::default(),
        }
    }
}

/// [agent.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhaseTimeoutsSection {
    pub understand: u64,
    pub plan: u64,
    pub execute: u64,
    pub reflect: u64,
    pub answer: u64,
}

impl Default for PhaseTimeoutsSection {
    fn default() -> Self {
        Self {
            understand: 30,
            plan: 45,
            execute: 300,
            reflect: 30,
            answer: 60,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_messages: usize,
    pub prune_threshold: usize,
    pub prune_to: usize,
    pub per_message_token_limit: usize,
    pub similarity_threshold: f32,
    pub recency_weight: f32,
    pub use_embeddings: bool,
    /// 摘要方式：simple / llm
    pub summarizer: String,
    /// 逐轮持久化：memory（进程内）/ file（每个会话一个 JSON 文件）
    pub store: String,
    pub store_dir: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_messages: 10,
            prune_threshold: 120,
            prune_to: 80,
            per_message_token_limit: 400,
            similarity_threshold: 0.3,
            recency_weight: 0.3,
            use_embeddings: true,
            summarizer: "simple".to_string(),
            store: "memory".to_string(),
            store_dir: PathBuf::from("data/memory"),
        }
    }
}

/// [session] 段：会话后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// memory / sqlite（后者需要 async-sqlite feature）
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/sessions.db"),
        }
    }
}

/// [tools] 段：单次调用超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub retry: RetrySection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            retry: RetrySection::default(),
        }
    }
}

/// 重试参数（[llm.retry] / [tools.retry]）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl AgentSection {
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        let t = &self.timeouts;
        OrchestratorConfig {
            max_iterations: self.max_iterations.max(1),
            context_window_turns: (self.context_window_turns > 0).then_some(self.context_window_turns),
            timeouts: PhaseTimeouts {
                understand: Duration::from_secs(t.understand),
                plan: Duration::from_secs(t.plan),
                execute: Duration::from_secs(t.execute),
                reflect: Duration::from_secs(t.reflect),
                answer: Duration::from_secs(t.answer),
            },
        }
    }
}

impl MemorySection {
    pub fn to_relevance_config(&self) -> RelevanceConfig {
        RelevanceConfig {
            max_messages: self.max_messages,
            similarity_threshold: self.similarity_threshold,
            recency_weight: self.recency_weight,
            use_embeddings: self.use_embeddings,
        }
    }

    pub fn to_memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            prune_threshold: self.prune_threshold,
            prune_to: self.prune_to,
            per_message_token_limit: self.per_message_token_limit,
            relevance: self.to_relevance_config(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CADENCE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CADENCE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
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
        config::Environment::with_prefix("CADENCE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建编排器）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
