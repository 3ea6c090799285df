//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::{ApiError, OpenAIError, StreamError};
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::Error as EventSourceError;

use crate::llm::{CompletionRequest, FragmentStream, LlmClient, LlmError};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与默认 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .map_err(|e| LlmError::Api(e.to_string()))?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.prompt.clone())
                .build()
                .map_err(|e| LlmError::Api(e.to_string()))?,
        ));

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(request.model.as_deref().unwrap_or(&self.model))
            .messages(messages);
        if let Some(max_tokens) = request.max_tokens {
            args.max_completion_tokens(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            args.temperature(temperature);
        }
        if stream {
            args.stream(true);
        }
        args.build().map_err(|e| LlmError::Api(e.to_string()))
    }
}

/// 按 async-openai 的错误类型归类（传输层看 reqwest 的超时 / 连接标志与状态码，API 错误看 type / code）
pub fn classify_openai_error(err: &OpenAIError) -> LlmError {
    let message = err.to_string();
    match err {
        OpenAIError::Reqwest(e) => classify_transport(e, message),
        OpenAIError::ApiError(api) => classify_api(api, message),
        OpenAIError::StreamError(stream) => match stream.as_ref() {
            StreamError::ReqwestEventSource(EventSourceError::Transport(e)) => {
                classify_transport(e, message)
            }
            StreamError::ReqwestEventSource(EventSourceError::InvalidStatusCode(status, _)) => {
                LlmError::from_status(status.as_u16(), message)
            }
            StreamError::ReqwestEventSource(EventSourceError::StreamEnded) => {
                LlmError::Connection(message)
            }
            _ => LlmError::Api(message),
        },
        OpenAIError::JSONDeserialize(..) => LlmError::MalformedOutput(message),
        _ => LlmError::Api(message),
    }
}

fn classify_transport(e: &reqwest::Error, message: String) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(message)
    } else if let Some(status) = e.status() {
        LlmError::from_status(status.as_u16(), message)
    } else if e.is_connect() || e.is_request() {
        LlmError::Connection(message)
    } else if e.is_decode() {
        LlmError::MalformedOutput(message)
    } else {
        LlmError::Api(message)
    }
}

fn classify_api(api: &ApiError, message: String) -> LlmError {
    let code = api.code.as_deref().unwrap_or_default();
    let kind = api.r#type.as_deref().unwrap_or_default();
    match (code, kind) {
        ("rate_limit_exceeded", _) | (_, "rate_limit_error" | "requests" | "tokens") => {
            LlmError::RateLimited(message)
        }
        ("timeout", _) | (_, "timeout_error") => LlmError::Timeout(message),
        ("server_error" | "service_unavailable", _)
        | (_, "server_error" | "overloaded_error" | "service_unavailable") => {
            LlmError::Connection(message)
        }
        _ => LlmError::Api(message),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let req = self.build_request(request, false)?;

        let response = self
            .client
            .chat()
            .create(req)
            .await
            .map_err(|e| classify_openai_error(&e))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        let req = self.build_request(request, true)?;
        let upstream = self
            .client
            .chat()
            .create_stream(req)
            .await
            .map_err(|e| classify_openai_error(&e))?;

        let fragments = upstream.filter_map(|chunk| async move {
            match chunk {
                Ok(resp) => resp
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.clone())
                    .filter(|s| !s.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(classify_openai_error(&e))),
            }
        });
        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::Transient;

    fn api_error(code: Option<&str>, kind: Option<&str>) -> OpenAIError {
        OpenAIError::ApiError(ApiError {
            message: "upstream said no".into(),
            r#type: kind.map(String::from),
            param: None,
            code: code.map(String::from),
        })
    }

    #[test]
    fn test_api_errors_classified_by_type_and_code() {
        assert!(matches!(
            classify_openai_error(&api_error(Some("rate_limit_exceeded"), None)),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            classify_openai_error(&api_error(None, Some("server_error"))),
            LlmError::Connection(_)
        ));
        let auth = classify_openai_error(&api_error(Some("invalid_api_key"), Some("invalid_request_error")));
        assert!(matches!(auth, LlmError::Api(_)));
        assert!(!auth.is_transient());
    }

    #[test]
    fn test_message_text_does_not_drive_classification() {
        let err = OpenAIError::ApiError(ApiError {
            message: "connection timed out while the client disconnected".into(),
            r#type: Some("invalid_request_error".into()),
            param: None,
            code: None,
        });
        assert!(matches!(classify_openai_error(&err), LlmError::Api(_)));
    }

    #[test]
    fn test_non_transport_errors_are_permanent() {
        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            classify_openai_error(&OpenAIError::JSONDeserialize(bad_json, "{".into())),
            LlmError::MalformedOutput(_)
        ));
        let stream = OpenAIError::StreamError(Box::new(StreamError::EventStream("bad frame".into())));
        assert!(!classify_openai_error(&stream).is_transient());
        assert!(!classify_openai_error(&OpenAIError::InvalidArgument("x".into())).is_transient());
    }
}
