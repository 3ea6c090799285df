//! 阶段枚举与单次运行的状态
//!
//! RunState 只属于一次 `run` 调用：累积的计划、任务结果、上一轮反思与指导文本。没有跨运行的全局可变状态。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::phases::{Plan, Reflection, TaskResults, Understanding};

/// 推理流水线的五个阶段；字符串形式（小写）用作指标键与 skip_phases
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Understand,
    Plan,
    Execute,
    Reflect,
    Answer,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 5] = [
        PhaseKind::Understand,
        PhaseKind::Plan,
        PhaseKind::Execute,
        PhaseKind::Reflect,
        PhaseKind::Answer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Understand => "understand",
            PhaseKind::Plan => "plan",
            PhaseKind::Execute => "execute",
            PhaseKind::Reflect => "reflect",
            PhaseKind::Answer => "answer",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseKind::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// 单次运行内累积的数据
#[derive(Debug, Clone)]
pub struct RunState {
    pub query: String,
    pub understanding: Understanding,
    pub plans: Vec<Plan>,
    pub results: TaskResults,
    pub last_reflection: Option<Reflection>,
    /// 上一轮反思派生的规划指导
    pub guidance: Option<String>,
    /// 理解与回答阶段使用的对话上下文（已格式化）
    pub context: String,
}

impl RunState {
    pub fn new(query: impl Into<String>, context: String) -> Self {
        let query = query.into();
        Self {
            understanding: Understanding::minimal(&query),
            query,
            plans: Vec::new(),
            results: TaskResults::new(),
            last_reflection: None,
            guidance: None,
            context,
        }
    }
}
