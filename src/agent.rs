//! 组件装配：从 AppConfig 构建 LLM、嵌入、记忆、会话存储、工具与编排器
//!
//! 没有可用 API Key 时退回 MockLlmClient 演示脚本，记忆退回纯新近度选择。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::task_executor::TaskExecutor;
use crate::llm::deepseek::deepseek_api_key;
use crate::llm::{
    create_deepseek_client, create_embedder_from_config, EmbeddingProvider, LlmClient,
    MockLlmClient, OpenAiClient, RetryingLlmClient,
};
use crate::memory::{
    FileMessageStore, LlmSummarizer, MemoryBuilder, MessageStore, SimpleSummarizer, Summarizer,
};
use crate::phases::PhaseSet;
use crate::session::SessionStore;
use crate::tools::{EchoTool, ToolDispatcher, ToolRegistry};

fn openai_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock），外面包一层重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let raw: Arc<dyn LlmClient> = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient::demo())
        }
        "openai" if openai_api_key().is_some() => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                openai_api_key().as_deref(),
            ))
        }
        _ if deepseek_api_key().is_some() => {
            tracing::info!(model = %cfg.llm.model, "Using DeepSeek LLM");
            Arc::new(create_deepseek_client(
                Some(&cfg.llm.model),
                cfg.llm.base_url.as_deref(),
            ))
        }
        _ => {
            tracing::warn!(provider = %provider, "No API key set, using Mock LLM");
            Arc::new(MockLlmClient::demo())
        }
    };
    Arc::new(
        RetryingLlmClient::new(raw, cfg.llm.retry.to_policy())
            .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request.max(1))),
    )
}

/// 嵌入提供方；关闭或无 Key 时为 None（相关性选择退回新近度）
pub fn create_embedder(cfg: &AppConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    if !cfg.embedding.enabled || !cfg.memory.use_embeddings {
        return None;
    }
    create_embedder_from_config(cfg.embedding.base_url.as_deref(), &cfg.embedding.model, None)
}

pub fn create_summarizer(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Arc<dyn Summarizer> {
    match cfg.memory.summarizer.to_lowercase().as_str() {
        "llm" => Arc::new(LlmSummarizer::new(llm)),
        _ => Arc::new(SimpleSummarizer::default()),
    }
}

/// 内置工具注册表
pub fn create_tool_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools
}

/// 会话存储：[session].backend = memory / sqlite
pub async fn create_session_store(cfg: &AppConfig, builder: MemoryBuilder) -> anyhow::Result<SessionStore> {
    match cfg.session.backend.to_lowercase().as_str() {
        "sqlite" => sqlite_store(cfg, builder).await,
        "memory" => Ok(SessionStore::new(builder)),
        other => {
            tracing::warn!(backend = %other, "unknown session backend, using memory");
            Ok(SessionStore::new(builder))
        }
    }
}

#[cfg(feature = "async-sqlite")]
async fn sqlite_store(cfg: &AppConfig, builder: MemoryBuilder) -> anyhow::Result<SessionStore> {
    let path = &cfg.session.sqlite_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let backend = crate::session::SqliteBackend::new(path)
        .await
        .with_context(|| format!("open session db {}", path.display()))?;
    tracing::info!(path = %path.display(), "sqlite session backend ready");
    Ok(SessionStore::with_backend(builder, Arc::new(backend)))
}

#[cfg(not(feature = "async-sqlite"))]
async fn sqlite_store(_cfg: &AppConfig, builder: MemoryBuilder) -> anyhow::Result<SessionStore> {
    tracing::warn!("sqlite session backend requires the async-sqlite feature, using memory");
    Ok(SessionStore::new(builder))
}

/// 按配置装配完整的编排器
/// 按 [memory].store 为每个会话挂上逐轮存储
pub fn with_message_store(cfg: &AppConfig, builder: MemoryBuilder) -> MemoryBuilder {
    match cfg.memory.store.as_str() {
        "file" => {
            let dir = cfg.memory.store_dir.clone();
            tracing::info!(dir = %dir.display(), "per-session turn files enabled");
            builder.store_factory(move |key: &str| {
                Arc::new(FileMessageStore::for_session(&dir, key)) as Arc<dyn MessageStore>
            })
        }
        "memory" => builder,
        other => {
            tracing::warn!(store = %other, "unknown memory store, using in-memory");
            builder
        }
    }
}

pub async fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<Orchestrator> {
    let llm = create_llm_from_config(cfg);

    let builder = MemoryBuilder::new(cfg.memory.to_memory_config())
        .summarizer(create_summarizer(cfg, llm.clone()))
        .embedder(create_embedder(cfg));
    let builder = with_message_store(cfg, builder);
    let sessions = Arc::new(
        create_session_store(cfg, builder)
            .await
            .context("Failed to create session store")?,
    );

    let dispatcher = Arc::new(ToolDispatcher::new(
        Arc::new(create_tool_registry()),
        Duration::from_secs(cfg.tools.tool_timeout_secs.max(1)),
        cfg.tools.retry.to_policy(),
    ));
    let executor = Arc::new(TaskExecutor::new(dispatcher));
    let phases = PhaseSet::llm_backed(llm, executor);

    Ok(Orchestrator::new(
        cfg.agent.to_orchestrator_config(),
        phases,
        sessions,
    ))
}
