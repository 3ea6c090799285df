//! Reflect：判断已有结果是否足以回答

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::llm::{complete_structured_or, CompletionRequest, LlmClient};
use crate::phases::prompts::{reflect_prompt, REFLECT_SYSTEM};
use crate::phases::types::{Plan, Reflection, TaskResults, Understanding};
use crate::phases::Phase;

#[derive(Debug, Clone)]
pub struct ReflectInput {
    pub query: String,
    pub understanding: Understanding,
    pub iteration: usize,
    pub max_iterations: usize,
    pub plans: Vec<Plan>,
    pub results: TaskResults,
}

pub struct ReflectPhase {
    llm: Arc<dyn LlmClient>,
}

impl ReflectPhase {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Phase for ReflectPhase {
    type Input = ReflectInput;
    type Output = Reflection;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Reflect
    }

    async fn run(&self, input: ReflectInput) -> Result<Reflection, AgentError> {
        let prompt = reflect_prompt(
            &input.query,
            &input.understanding,
            input.iteration,
            input.max_iterations,
            &input.plans,
            &input.results,
        );
        let request = CompletionRequest::new(prompt)
            .with_system(REFLECT_SYSTEM)
            .with_temperature(0.0);
        let fallback = Reflection::inconclusive("reflection output could not be parsed");
        Ok(complete_structured_or(self.llm.as_ref(), request, fallback).await?)
    }
}
