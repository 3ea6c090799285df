//! 任务执行器：按计划顺序逐个执行任务
//!
//! 任务之间严格串行（depends_on 只记录不调度）；单个任务内的工具调用彼此独立，并发分发后一起等待，
//! 某个调用失败不取消其兄弟调用。任一任务失败都不影响后续任务。

use std::sync::Arc;

use futures_util::future::join_all;

use crate::phases::types::{Plan, ResultSink, Task, TaskResult, TaskStatus};
use crate::tools::{ToolDispatcher, ToolError};

pub struct TaskExecutor {
    dispatcher: Arc<ToolDispatcher>,
}

impl TaskExecutor {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// 执行计划中的全部任务，每完成一个就写入 sink；返回实际执行的任务数
    pub async fn execute_tasks(&self, plan: &mut Plan, sink: &mut dyn ResultSink) -> usize {
        let mut executed = 0;
        for task in plan.tasks.iter_mut() {
            if task.id.trim().is_empty() {
                tracing::warn!(description = %task.description, "task without id skipped");
                continue;
            }
            task.status = TaskStatus::Running;
            let result = self.execute_task(task).await;
            task.status = if result.failed {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            tracing::debug!(task_id = %task.id, failed = result.failed, "task finished");
            sink.record(&task.id, result);
            executed += 1;
        }
        executed
    }

    async fn execute_task(&self, task: &Task) -> TaskResult {
        if task.tool_calls.is_empty() {
            return TaskResult::ok(task.description.clone());
        }

        let outcomes = join_all(task.tool_calls.iter().map(|c| self.dispatcher.dispatch(c))).await;
        let n = outcomes.len();

        let mut outputs = Vec::new();
        let mut errors = Vec::new();
        let mut all_timeouts = true;
        for (call, outcome) in task.tool_calls.iter().zip(outcomes) {
            match outcome {
                Ok(out) => outputs.push(out),
                Err(e) => {
                    all_timeouts &= matches!(e, ToolError::Timeout(_));
                    errors.push(format!("{}: {e}", call.tool));
                }
            }
        }

        let result = if errors.is_empty() {
            TaskResult::ok(outputs.join("\n"))
        } else if all_timeouts {
            TaskResult::timed_out(errors.join("; "))
        } else {
            TaskResult::failure(errors.join("; "))
        };
        result.with_tool_calls(n)
    }
}
