//! 推理阶段：Understand → Plan → Execute → Reflect → Answer
//!
//! 每个阶段实现同一个 Phase trait（kind + run），编排器按变体各持有一个 `Arc<dyn Phase<..>>`，
//! 测试中可替换为桩实现。

pub mod answer;
pub mod execute;
pub mod plan;
pub mod prompts;
pub mod reflect;
pub mod types;
pub mod understand;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::core::task_executor::TaskExecutor;
use crate::llm::{FragmentStream, LlmClient};

pub use answer::{AnswerInput, AnswerPhase};
pub use execute::{ExecuteInput, ExecutePhase, ExecuteReport};
pub use plan::{PlanInput, PlanPhase};
pub use reflect::{ReflectInput, ReflectPhase};
pub use types::{
    ChannelSink, Entity, Plan, Reflection, ResultSink, Task, TaskResult, TaskResults, TaskStatus,
    TaskType, ToolCall, Understanding,
};
pub use understand::{UnderstandInput, UnderstandPhase};

/// 一个推理阶段：输入 → 输出，失败以 AgentError 返回（由编排器吸收为阶段失败）
#[async_trait]
pub trait Phase: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn kind(&self) -> PhaseKind;

    async fn run(&self, input: Self::Input) -> Result<Self::Output, AgentError>;
}

pub type DynPhase<I, O> = Arc<dyn Phase<Input = I, Output = O>>;

/// 编排器使用的五个阶段
#[derive(Clone)]
pub struct PhaseSet {
    pub understand: DynPhase<UnderstandInput, Understanding>,
    pub plan: DynPhase<PlanInput, Plan>,
    pub execute: DynPhase<ExecuteInput, ExecuteReport>,
    pub reflect: DynPhase<ReflectInput, Reflection>,
    pub answer: DynPhase<AnswerInput, FragmentStream>,
}

impl PhaseSet {
    /// 基于 LLM 的默认阶段；Plan 的工具目录取自执行器的注册表
    pub fn llm_backed(llm: Arc<dyn LlmClient>, executor: Arc<TaskExecutor>) -> Self {
        let catalog = executor.dispatcher().registry().to_schema_json();
        Self {
            understand: Arc::new(UnderstandPhase::new(llm.clone())),
            plan: Arc::new(PlanPhase::new(llm.clone(), catalog)),
            execute: Arc::new(ExecutePhase::new(executor)),
            reflect: Arc::new(ReflectPhase::new(llm.clone())),
            answer: Arc::new(AnswerPhase::new(llm)),
        }
    }
}
