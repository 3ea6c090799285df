//! Execute：把本轮计划交给 TaskExecutor
//!
//! 结果经 ChannelSink 逐个送回编排器，阶段超时被取消时已完成任务的结果仍然保留。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::error::AgentError;
use crate::core::state::PhaseKind;
use crate::core::task_executor::TaskExecutor;
use crate::phases::types::{ChannelSink, Plan};
use crate::phases::Phase;

pub struct ExecuteInput {
    pub iteration: usize,
    pub plan: Plan,
    pub sink: ChannelSink,
}

/// 执行后的计划（任务状态已更新）与实际执行的任务数
#[derive(Debug, Clone)]
pub struct ExecuteReport {
    pub plan: Plan,
    pub executed: usize,
}

pub struct ExecutePhase {
    executor: Arc<TaskExecutor>,
}

impl ExecutePhase {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Phase for ExecutePhase {
    type Input = ExecuteInput;
    type Output = ExecuteReport;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Execute
    }

    async fn run(&self, input: ExecuteInput) -> Result<ExecuteReport, AgentError> {
        let ExecuteInput {
            iteration,
            mut plan,
            mut sink,
        } = input;
        let executed = self.executor.execute_tasks(&mut plan, &mut sink).await;
        tracing::debug!(iteration, executed, "tasks executed");
        Ok(ExecuteReport { plan, executed })
    }
}
