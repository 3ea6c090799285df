//! 核心编排层：错误、重试、状态与指标、回调与事件、任务执行、反思分析、主控循环

pub mod analyzer;
pub mod callbacks;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod task_executor;

pub use analyzer::{IterationOutcome, ReflectionAnalyzer, Verdict};
pub use callbacks::{safe_call, AgentCallbacks};
pub use error::AgentError;
pub use events::RunEvent;
pub use metrics::{RunMetrics, StopReason};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, PhaseFailure, PhaseOutcome, PhaseTimeouts, RunRequest,
    EXECUTOR_ERROR_PREFIX,
};
pub use retry::{RetryPolicy, Transient};
pub use state::{PhaseKind, RunState};
pub use task_executor::TaskExecutor;
