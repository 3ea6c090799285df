//! Understand：识别意图与实体（每次运行一次）

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::llm::{complete_structured_or, CompletionRequest, LlmClient};
use crate::phases::prompts::{understand_prompt, UNDERSTAND_SYSTEM};
use crate::phases::types::Understanding;
use crate::phases::Phase;

#[derive(Debug, Clone)]
pub struct UnderstandInput {
    pub query: String,
    /// 已格式化的对话上下文（可为空）
    pub context: String,
}

pub struct UnderstandPhase {
    llm: Arc<dyn LlmClient>,
}

impl UnderstandPhase {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Phase for UnderstandPhase {
    type Input = UnderstandInput;
    type Output = Understanding;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Understand
    }

    async fn run(&self, input: UnderstandInput) -> Result<Understanding, AgentError> {
        let request = CompletionRequest::new(understand_prompt(&input.query, &input.context))
            .with_system(UNDERSTAND_SYSTEM)
            .with_temperature(0.0);
        let mut understanding =
            complete_structured_or(self.llm.as_ref(), request, Understanding::minimal(&input.query))
                .await?;
        if understanding.intent.trim().is_empty() {
            understanding.intent = input.query;
        }
        Ok(understanding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_parses_understanding() {
        let llm = MockLlmClient::new().with_rule(
            "[phase:understand]",
            r#"{"intent": "price lookup", "entities": [{"type": "ticker", "value": "AAPL"}]}"#,
        );
        let out = UnderstandPhase::new(Arc::new(llm))
            .run(UnderstandInput {
                query: "AAPL price?".into(),
                context: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.intent, "price lookup");
        assert_eq!(out.entities[0].value, "AAPL");
    }

    #[tokio::test]
    async fn test_unparseable_output_gives_minimal() {
        let llm = MockLlmClient::new().with_rule("[phase:understand]", "no idea, sorry");
        let out = UnderstandPhase::new(Arc::new(llm))
            .run(UnderstandInput {
                query: "what now".into(),
                context: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(out, Understanding::minimal("what now"));
    }
}
