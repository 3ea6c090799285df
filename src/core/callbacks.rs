//! 调用方观察回调：固定的可选函数字段，统一经 safe_call 调用
//!
//! 回调 panic 会被捕获并记录日志，永远不会影响编排流程。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::metrics::RunMetrics;
use crate::core::state::PhaseKind;
use crate::phases::{Plan, Reflection, TaskResult, Understanding};

pub type PhaseCallback = Arc<dyn Fn(PhaseKind) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AgentCallbacks {
    pub on_phase_start: Option<PhaseCallback>,
    pub on_phase_complete: Option<PhaseCallback>,
    pub on_iteration_start: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    pub on_understanding: Option<Arc<dyn Fn(&Understanding) + Send + Sync>>,
    pub on_plan_created: Option<Arc<dyn Fn(&Plan, usize) + Send + Sync>>,
    pub on_task_complete: Option<Arc<dyn Fn(&str, &TaskResult) + Send + Sync>>,
    pub on_reflection: Option<Arc<dyn Fn(&Reflection, usize) + Send + Sync>>,
    pub on_answer_fragment: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// 每次运行恰好触发一次，参数为定稿后的指标
    pub on_metrics: Option<Arc<dyn Fn(&RunMetrics) + Send + Sync>>,
}

/// 调用 f，捕获 panic 并记录日志
pub fn safe_call<F: FnOnce()>(name: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!(callback = name, error = %msg, "callback panicked; ignored");
    }
}

impl AgentCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn phase_start(&self, phase: PhaseKind) {
        if let Some(cb) = &self.on_phase_start {
            safe_call("on_phase_start", || cb(phase));
        }
    }

    pub(crate) fn phase_complete(&self, phase: PhaseKind) {
        if let Some(cb) = &self.on_phase_complete {
            safe_call("on_phase_complete", || cb(phase));
        }
    }

    pub(crate) fn iteration_start(&self, iteration: usize) {
        if let Some(cb) = &self.on_iteration_start {
            safe_call("on_iteration_start", || cb(iteration));
        }
    }

    pub(crate) fn understanding(&self, u: &Understanding) {
        if let Some(cb) = &self.on_understanding {
            safe_call("on_understanding", || cb(u));
        }
    }

    pub(crate) fn plan_created(&self, plan: &Plan, iteration: usize) {
        if let Some(cb) = &self.on_plan_created {
            safe_call("on_plan_created", || cb(plan, iteration));
        }
    }

    pub(crate) fn task_complete(&self, task_id: &str, result: &TaskResult) {
        if let Some(cb) = &self.on_task_complete {
            safe_call("on_task_complete", || cb(task_id, result));
        }
    }

    pub(crate) fn reflection(&self, r: &Reflection, iteration: usize) {
        if let Some(cb) = &self.on_reflection {
            safe_call("on_reflection", || cb(r, iteration));
        }
    }

    pub(crate) fn answer_fragment(&self, fragment: &str) {
        if let Some(cb) = &self.on_answer_fragment {
            safe_call("on_answer_fragment", || cb(fragment));
        }
    }

    pub(crate) fn metrics(&self, m: &RunMetrics) {
        if let Some(cb) = &self.on_metrics {
            safe_call("on_metrics", || cb(m));
        }
    }
}

impl std::fmt::Debug for AgentCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCallbacks")
            .field("on_phase_start", &self.on_phase_start.is_some())
            .field("on_phase_complete", &self.on_phase_complete.is_some())
            .field("on_metrics", &self.on_metrics.is_some())
            .finish_non_exhaustive()
    }
}
