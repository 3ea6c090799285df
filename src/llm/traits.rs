//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete（非流式）、stream（流式片段）。
//! 错误统一为 LlmError，并区分瞬时（限流 / 超时 / 连接）与永久失败，供重试策略判断。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::core::retry::Transient;

/// 有限、不可重启的文本片段流
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 一次生成请求
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// 覆盖客户端默认模型
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

impl LlmError {
    /// 按 HTTP 状态码归类：429 限流，408 / 504 超时，其余 5xx 按连接类处理，其他为永久错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => LlmError::RateLimited(message),
            408 | 504 => LlmError::Timeout(message),
            500..=599 => LlmError::Connection(message),
            _ => LlmError::Api(message),
        }
    }

    /// 没有类型化错误的提供方：按消息中的整词归类（"disconnected" 不算 "connect"）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let has = |w: &str| words.iter().any(|x| *x == w);
        let phrase = |p: &str| {
            let parts: Vec<&str> = p.split(' ').collect();
            words.windows(parts.len()).any(|win| win == parts.as_slice())
        };

        if has("429")
            || has("ratelimit")
            || phrase("rate limit")
            || phrase("rate limited")
            || phrase("too many requests")
        {
            LlmError::RateLimited(message)
        } else if has("timeout") || has("408") || has("504") || phrase("timed out") {
            LlmError::Timeout(message)
        } else if has("connection")
            || has("connect")
            || has("network")
            || has("unavailable")
            || has("502")
            || has("503")
            || phrase("error sending request")
        {
            LlmError::Connection(message)
        } else {
            LlmError::Api(message)
        }
    }
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_) | LlmError::Timeout(_) | LlmError::Connection(_)
        )
    }
}

/// LLM 客户端 trait：非流式完成与流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// 流式完成；默认实现把 complete 的结果作为单个片段
    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        let content = self.complete(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
