//! 运行级错误类型
//!
//! 各层错误（LlmError / ToolError / MemoryError）通过 From 汇入 AgentError。
//! 绝大多数失败在编排层被吸收为数据（失败任务、失败阶段、停止原因），
//! 只有逃逸出运行主体的错误才会以 AgentError 返回给调用方。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::tools::ToolError;

/// 一次运行中可能向调用方传播的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Empty query")]
    EmptyQuery,

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}
