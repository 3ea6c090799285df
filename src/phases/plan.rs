//! Plan：生成本轮任务列表（任务 id 的命名空间由编排器统一处理）

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::llm::{complete_structured_or, CompletionRequest, LlmClient};
use crate::phases::prompts::{plan_prompt, render_prior_work, PLAN_SYSTEM};
use crate::phases::types::{Plan, TaskResults, Understanding};
use crate::phases::Phase;

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub query: String,
    pub understanding: Understanding,
    pub iteration: usize,
    /// 上一轮反思给出的指导
    pub guidance: Option<String>,
    pub prior_plans: Vec<Plan>,
    pub results: TaskResults,
}

pub struct PlanPhase {
    llm: Arc<dyn LlmClient>,
    tool_catalog: String,
}

impl PlanPhase {
    pub fn new(llm: Arc<dyn LlmClient>, tool_catalog: impl Into<String>) -> Self {
        Self {
            llm,
            tool_catalog: tool_catalog.into(),
        }
    }
}

#[async_trait]
impl Phase for PlanPhase {
    type Input = PlanInput;
    type Output = Plan;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Plan
    }

    async fn run(&self, input: PlanInput) -> Result<Plan, AgentError> {
        let prior = render_prior_work(&input.prior_plans, &input.results);
        let prompt = plan_prompt(
            &input.query,
            &input.understanding,
            Some(&prior),
            input.guidance.as_deref(),
            &self.tool_catalog,
        );
        let request = CompletionRequest::new(prompt)
            .with_system(PLAN_SYSTEM)
            .with_temperature(0.2);
        let plan = complete_structured_or(self.llm.as_ref(), request, Plan::default()).await?;
        tracing::debug!(iteration = input.iteration, tasks = plan.tasks.len(), "plan generated");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn input() -> PlanInput {
        PlanInput {
            query: "q".into(),
            understanding: Understanding::minimal("q"),
            iteration: 1,
            guidance: None,
            prior_plans: Vec::new(),
            results: TaskResults::new(),
        }
    }

    #[tokio::test]
    async fn test_fenced_plan_is_parsed() {
        let plan = PlanPhase::new(Arc::new(MockLlmClient::demo()), "[]")
            .run(input())
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].id, "t1");
        assert_eq!(plan.tasks[0].tool_calls[0].tool, "echo");
    }

    #[tokio::test]
    async fn test_garbage_gives_empty_plan() {
        let llm = MockLlmClient::new().with_rule("[phase:plan]", "I would rather not");
        let plan = PlanPhase::new(Arc::new(llm), "[]").run(input()).await.unwrap();
        assert!(plan.is_empty());
    }
}
