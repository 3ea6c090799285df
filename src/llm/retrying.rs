//! 带重试的 LLM 包装：瞬时错误（限流 / 超时 / 连接）按 RetryPolicy 退避重试
//!
//! 流式请求只重试建立连接这一步；流开始之后的错误原样交给消费方。
//! 可选的单次请求超时作用于每一次尝试，超时记为瞬时的 LlmError::Timeout。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::retry::RetryPolicy;
use crate::llm::{CompletionRequest, FragmentStream, LlmClient, LlmError};

pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    policy: RetryPolicy,
    request_timeout: Option<Duration>,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = Some(limit);
        self
    }
}

async fn bounded<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(LlmError::Timeout(format!(
                "no response within {}ms",
                limit.as_millis()
            )))
        }),
        None => fut.await,
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let inner = &self.inner;
        let limit = self.request_timeout;
        self.policy
            .run("llm.complete", move || bounded(limit, inner.complete(request)))
            .await
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        let inner = &self.inner;
        let limit = self.request_timeout;
        self.policy
            .run("llm.stream", move || bounded(limit, inner.stream(request)))
            .await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 failures 次返回给定错误，之后成功
    struct FlakyLlm {
        calls: AtomicU32,
        failures: u32,
        error: LlmError,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let inner = Arc::new(FlakyLlm {
            calls: AtomicU32::new(0),
            failures: 2,
            error: LlmError::RateLimited("429".into()),
        });
        let client = RetryingLlmClient::new(inner.clone(), RetryPolicy::default());
        let out = client.complete(&CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_is_returned() {
        let inner = Arc::new(FlakyLlm {
            calls: AtomicU32::new(0),
            failures: 10,
            error: LlmError::Timeout("slow".into()),
        });
        let client = RetryingLlmClient::new(inner.clone(), RetryPolicy::default());
        let err = client.complete(&CompletionRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_api_error_is_not_retried() {
        let inner = Arc::new(FlakyLlm {
            calls: AtomicU32::new(0),
            failures: 10,
            error: LlmError::Api("bad key".into()),
        });
        let client = RetryingLlmClient::new(inner.clone(), RetryPolicy::default());
        assert!(client.complete(&CompletionRequest::new("hi")).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    struct SilentLlm;

    #[async_trait]
    impl LlmClient for SilentLlm {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_becomes_transient_timeout() {
        let client = RetryingLlmClient::new(Arc::new(SilentLlm), RetryPolicy::no_retry())
            .with_request_timeout(Duration::from_secs(5));
        let err = client.complete(&CompletionRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
