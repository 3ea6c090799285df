//! 轮次摘要：截断式（无需 LLM）与 LLM 式（失败时退回截断式）

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient};

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// 为一轮问答生成简短摘要；实现自身负责降级，不返回错误
    async fn summarize(&self, query: &str, answer: &str) -> String;
}

/// 截断拼接："<query 前 60 字> → <answer 前 80 字>"，被截断处加 "..."
#[derive(Debug, Clone)]
pub struct SimpleSummarizer {
    pub max_query_chars: usize,
    pub max_answer_chars: usize,
}

impl Default for SimpleSummarizer {
    fn default() -> Self {
        Self {
            max_query_chars: 60,
            max_answer_chars: 80,
        }
    }
}

/// 压平换行并按字符数截断
pub(crate) fn clip(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    let flat = flat.trim();
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        flat.to_string()
    }
}

impl SimpleSummarizer {
    pub fn summarize_now(&self, query: &str, answer: &str) -> String {
        format!(
            "{} → {}",
            clip(query, self.max_query_chars),
            clip(answer, self.max_answer_chars)
        )
    }
}

#[async_trait]
impl Summarizer for SimpleSummarizer {
    async fn summarize(&self, query: &str, answer: &str) -> String {
        self.summarize_now(query, answer)
    }
}

const SUMMARY_SYSTEM: &str = "[phase:summarize] You write one or two sentence summaries of a \
question and its answer, keeping the key facts. Reply with the summary only.";

/// 用 LLM 生成 1~2 句摘要；回答过长时先截到 500 字
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    fallback: SimpleSummarizer,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            fallback: SimpleSummarizer::default(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, query: &str, answer: &str) -> String {
        let prompt = format!("Question: {}\nAnswer: {}", query.trim(), clip(answer, 500));
        let request = CompletionRequest::new(prompt)
            .with_system(SUMMARY_SYSTEM)
            .with_max_tokens(120)
            .with_temperature(0.0);
        match self.llm.complete(&request).await {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            Ok(_) => self.fallback.summarize_now(query, answer),
            Err(e) => {
                tracing::warn!(error = %e, "llm summarizer failed, using truncation");
                self.fallback.summarize_now(query, answer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    #[tokio::test]
    async fn test_simple_summary_truncates_both_sides() {
        let s = SimpleSummarizer::default();
        let q = "q".repeat(70);
        let a = format!("line one\nline two {}", "a".repeat(100));
        let out = s.summarize(&q, &a).await;
        let (left, right) = out.split_once(" → ").unwrap();
        assert_eq!(left, format!("{}...", "q".repeat(60)));
        assert!(right.starts_with("line one line two"));
        assert!(right.ends_with("..."));
        assert_eq!(right.chars().count(), 83);
    }

    #[tokio::test]
    async fn test_short_texts_are_untouched() {
        let out = SimpleSummarizer::default().summarize("hi", "hello").await;
        assert_eq!(out, "hi → hello");
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _r: &CompletionRequest) -> Result<String, LlmError> {
            Err(LlmError::Connection("down".into()))
        }
    }

    #[tokio::test]
    async fn test_llm_summarizer_uses_model_output() {
        let llm = Arc::new(MockLlmClient::new().with_rule("[phase:summarize]", " Short summary. "));
        let out = LlmSummarizer::new(llm).summarize("q", "a").await;
        assert_eq!(out, "Short summary.");
    }

    #[tokio::test]
    async fn test_llm_summarizer_falls_back_on_error() {
        let out = LlmSummarizer::new(Arc::new(FailingLlm)).summarize("q", "a").await;
        assert_eq!(out, "q → a");
    }
}
