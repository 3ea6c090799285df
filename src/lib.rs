//! Cadence - 多轮推理引擎
//!
//! 模块划分：
//! - **agent**: 按配置装配 LLM、记忆、会话、工具与编排器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排循环、阶段超时、重试、反思分析、任务执行、指标与回调
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、结构化输出、嵌入
//! - **memory**: 对话轮次、相关性选择、摘要、持久化
//! - **phases**: Understand / Plan / Execute / Reflect / Answer 五个阶段
//! - **session**: 按 key 加锁的会话存储与持久化后端
//! - **tools**: 工具注册表与带重试的分发器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod phases;
pub mod session;
pub mod tools;

pub use crate::core::{AgentError, Orchestrator, OrchestratorConfig, RunEvent, RunRequest, StopReason};
