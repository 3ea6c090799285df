//! 运行级指标：每次 run 一份，结束时恰好定稿一次，通过回调 / 日志 / 事件输出，不持久化

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::PhaseKind;

/// Plan/Execute/Reflect 循环的停止原因（封闭枚举）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ReflectionComplete,
    MaxIterations,
    NoProgress,
    HighConfidence,
    Timeout,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::ReflectionComplete => "reflection_complete",
            StopReason::MaxIterations => "max_iterations",
            StopReason::NoProgress => "no_progress",
            StopReason::HighConfidence => "high_confidence",
            StopReason::Timeout => "timeout",
            StopReason::Error => "error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub run_id: String,
    pub query: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub iteration_count: usize,
    /// 同一阶段多次运行时累加
    pub phase_timings: BTreeMap<PhaseKind, Duration>,
    pub phase_attempts: BTreeMap<PhaseKind, u32>,
    pub tool_call_count: usize,
    pub errors: Vec<String>,
    pub stop_reason: Option<StopReason>,
    started: Instant,
    elapsed: Option<Duration>,
}

impl RunMetrics {
    pub fn new(run_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            query: query.into(),
            start_time: Utc::now(),
            end_time: None,
            iteration_count: 0,
            phase_timings: BTreeMap::new(),
            phase_attempts: BTreeMap::new(),
            tool_call_count: 0,
            errors: Vec::new(),
            stop_reason: None,
            started: Instant::now(),
            elapsed: None,
        }
    }

    /// 记录一次阶段尝试及其耗时（超时也算一次尝试）
    pub fn record_phase(&mut self, phase: PhaseKind, elapsed: Duration) {
        *self.phase_timings.entry(phase).or_default() += elapsed;
        *self.phase_attempts.entry(phase).or_default() += 1;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn add_tool_calls(&mut self, n: usize) {
        self.tool_call_count += n;
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// 定稿：仅第一次调用生效，返回是否本次完成定稿
    pub fn finalize(&mut self, reason: StopReason) -> bool {
        if self.is_finalized() {
            return false;
        }
        self.end_time = Some(Utc::now());
        self.elapsed = Some(self.started.elapsed());
        self.stop_reason = Some(reason);
        true
    }

    pub fn total_duration(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    /// 结构化日志 / 事件使用的 JSON 视图（时长以毫秒表示）
    pub fn to_json(&self) -> serde_json::Value {
        let timings: serde_json::Map<String, serde_json::Value> = self
            .phase_timings
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v.as_millis() as u64)))
            .collect();
        let attempts: serde_json::Map<String, serde_json::Value> = self
            .phase_attempts
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect();
        serde_json::json!({
            "event": "run_metrics",
            "run_id": self.run_id,
            "query": self.query,
            "start_time": self.start_time.to_rfc3339(),
            "end_time": self.end_time.map(|t| t.to_rfc3339()),
            "duration_ms": self.total_duration().as_millis() as u64,
            "iteration_count": self.iteration_count,
            "phase_timings_ms": timings,
            "phase_attempts": attempts,
            "tool_call_count": self.tool_call_count,
            "errors": self.errors,
            "stop_reason": self.stop_reason.map(|r| r.as_str()),
        })
    }
}
