//! 运行过程事件：供网关流式转发（序列化为 JSON，type 字段区分）

use serde::Serialize;

use crate::core::metrics::StopReason;
use crate::core::state::PhaseKind;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 第几轮 Plan/Execute/Reflect
    IterationStart { iteration: usize, max_iterations: usize },
    PhaseStart { phase: PhaseKind },
    /// 阶段结束；失败或超时时带 error
    PhaseComplete {
        phase: PhaseKind,
        failed: bool,
        timeout: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PlanCreated {
        iteration: usize,
        summary: String,
        task_ids: Vec<String>,
    },
    TaskComplete {
        task_id: String,
        failed: bool,
        preview: String,
    },
    Reflection {
        iteration: usize,
        is_complete: bool,
        reasoning: String,
    },
    /// 循环结束
    Stopped { reason: StopReason },
    /// 最终回答的一小段（流式输出）
    AnswerChunk { text: String },
    AnswerDone,
    Metrics { metrics: serde_json::Value },
    Error { text: String },
}
