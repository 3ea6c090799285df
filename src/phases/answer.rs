//! Answer：流式生成最终回答

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::llm::{CompletionRequest, FragmentStream, LlmClient};
use crate::phases::prompts::{answer_prompt, ANSWER_SYSTEM};
use crate::phases::types::{Plan, TaskResults, Understanding};
use crate::phases::Phase;

#[derive(Debug, Clone)]
pub struct AnswerInput {
    pub query: String,
    pub understanding: Understanding,
    pub plans: Vec<Plan>,
    pub results: TaskResults,
    pub context: String,
}

pub struct AnswerPhase {
    llm: Arc<dyn LlmClient>,
}

impl AnswerPhase {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Phase for AnswerPhase {
    type Input = AnswerInput;
    type Output = FragmentStream;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Answer
    }

    async fn run(&self, input: AnswerInput) -> Result<FragmentStream, AgentError> {
        let prompt = answer_prompt(
            &input.query,
            &input.understanding,
            &input.plans,
            &input.results,
            &input.context,
        );
        let request = CompletionRequest::new(prompt).with_system(ANSWER_SYSTEM);
        Ok(self.llm.stream(&request).await?)
    }
}
