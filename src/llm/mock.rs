//! Mock LLM 客户端（用于测试与无 Key 演示，无需 API）
//!
//! 按规则匹配：system + prompt 中包含某个片段即返回对应回复；无匹配时回显 prompt 的最后一行。
//! stream 把回复按空白切成多个片段，便于验证流式拼接。

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{CompletionRequest, FragmentStream, LlmClient, LlmError};

#[derive(Debug, Default, Clone)]
pub struct MockLlmClient {
    rules: Vec<(String, String)>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加规则：请求文本包含 needle 时返回 response（先加入的规则优先）
    pub fn with_rule(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }

    /// 覆盖五个推理阶段的演示脚本：单轮 echo 计划，反思即判定完成
    pub fn demo() -> Self {
        Self::new()
            .with_rule(
                "[phase:understand]",
                r#"{"intent": "answer the user's question", "entities": []}"#,
            )
            .with_rule(
                "[phase:plan]",
                r#"```json
{"summary": "echo the request", "tasks": [{"id": "t1", "description": "echo the query", "taskType": "use_tools", "dependsOn": [], "toolCalls": [{"tool": "echo", "args": {"text": "mock observation"}}]}]}
```"#,
            )
            .with_rule(
                "[phase:reflect]",
                r#"{"isComplete": true, "reasoning": "echo finished", "missingInfo": [], "suggestedNextSteps": "", "confidence": 0.95}"#,
            )
            .with_rule("[phase:summarize]", "User asked a question; agent echoed it.")
    }

    fn respond(&self, request: &CompletionRequest) -> String {
        let haystack = format!(
            "{}\n{}",
            request.system_prompt.as_deref().unwrap_or(""),
            request.prompt
        );
        if let Some((_, response)) = self.rules.iter().find(|(needle, _)| haystack.contains(needle)) {
            return response.clone();
        }
        let last_line = request
            .prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("(no input)");
        format!("Echo from Mock: {}", last_line.trim())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        Ok(self.respond(request))
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        let content = self.respond(request);
        let mut fragments: Vec<Result<String, LlmError>> = Vec::new();
        let mut current = String::new();
        for ch in content.chars() {
            current.push(ch);
            if ch.is_whitespace() {
                fragments.push(Ok(std::mem::take(&mut current)));
            }
        }
        if !current.is_empty() {
            fragments.push(Ok(current));
        }
        Ok(Box::pin(stream::iter(fragments)))
    }
}
