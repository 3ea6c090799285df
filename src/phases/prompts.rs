//! 各阶段的 system prompt 与用户 prompt 拼装
//!
//! system prompt 开头的 `[phase:*]` 标记用于区分阶段（Mock 客户端按它匹配演示脚本）。

use crate::phases::types::{Plan, TaskResults, Understanding};

pub const UNDERSTAND_SYSTEM: &str = "[phase:understand] You analyse a user's question before any work \
is done. Identify the user's intent in one sentence and list the key entities (companies, tickers, \
dates, metrics, people, places) mentioned or implied.";

pub const PLAN_SYSTEM: &str = "[phase:plan] You break a question into a short list of concrete tasks. \
Each task has a short id, a description, a taskType (\"use_tools\" when it needs tool calls, \"reason\" \
when it is pure reasoning), optional dependsOn ids and, for use_tools tasks, the toolCalls to run. \
Only use tools from the catalogue. Do not repeat work that already succeeded.";

pub const REFLECT_SYSTEM: &str = "[phase:reflect] You judge whether the work done so far is enough to \
answer the question. Set isComplete only when the results cover everything the question asks. \
Otherwise list missingInfo and give suggestedNextSteps for the next planning pass. \
Give a confidence between 0 and 1.";

pub const ANSWER_SYSTEM: &str = "[phase:answer] You write the final answer to the user's question \
using the task results and conversation context provided. Be direct and cite the data you used. \
If the results are incomplete, say what is missing instead of guessing.";

/// 单条任务结果写入 prompt 时的最大字符数
pub const MAX_RESULT_CHARS: usize = 1000;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}... [truncated]")
    } else {
        text.to_string()
    }
}

pub fn render_entities(u: &Understanding) -> String {
    if u.entities.is_empty() {
        return "None identified".to_string();
    }
    u.entities
        .iter()
        .map(|e| format!("{}: {}", e.entity_type, e.value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 前几轮计划的完成情况：`Pass i: <summary>` 与每个任务的 ✓ / ✗
pub fn render_prior_work(plans: &[Plan], results: &TaskResults) -> String {
    let mut lines = Vec::new();
    for (i, plan) in plans.iter().enumerate() {
        lines.push(format!("Pass {}: {}", i + 1, plan.summary));
        for task in &plan.tasks {
            let mark = match results.get(&task.id) {
                Some(r) if !r.failed => "✓",
                _ => "✗",
            };
            lines.push(format!("  {mark} {}", task.description));
        }
    }
    lines.join("\n")
}

/// 任务结果列表（插入顺序），每条截断到 MAX_RESULT_CHARS
pub fn render_results(results: &TaskResults) -> String {
    if results.is_empty() {
        return "No task results.".to_string();
    }
    results
        .iter()
        .map(|(id, r)| {
            let state = if r.timeout {
                "timeout"
            } else if r.failed {
                "failed"
            } else {
                "ok"
            };
            format!("- [{id}] ({state}) {}", truncate(r.display_text(), MAX_RESULT_CHARS))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn understand_prompt(query: &str, context: &str) -> String {
    let mut out = String::new();
    if !context.is_empty() {
        out.push_str(context);
        out.push('\n');
    }
    out.push_str(&format!("User query: {query}"));
    out
}

pub fn plan_prompt(
    query: &str,
    understanding: &Understanding,
    prior_work: Option<&str>,
    guidance: Option<&str>,
    tool_catalog: &str,
) -> String {
    let mut out = format!(
        "Intent: {}\nEntities: {}\n\nAvailable tools:\n{tool_catalog}\n",
        understanding.intent,
        render_entities(understanding)
    );
    if let Some(prior) = prior_work.filter(|p| !p.is_empty()) {
        out.push_str(&format!("\nWork already done:\n{prior}\n"));
    }
    if let Some(g) = guidance.filter(|g| !g.is_empty()) {
        out.push_str(&format!("\nGuidance from the last review:\n{g}\n"));
    }
    out.push_str(&format!("\nUser query: {query}"));
    out
}

pub fn reflect_prompt(
    query: &str,
    understanding: &Understanding,
    iteration: usize,
    max_iterations: usize,
    plans: &[Plan],
    results: &TaskResults,
) -> String {
    format!(
        "Intent: {}\nPass {iteration} of at most {max_iterations}.\n\nWork so far:\n{}\n\nResults:\n{}\n\nUser query: {query}",
        understanding.intent,
        render_prior_work(plans, results),
        render_results(results),
    )
}

pub fn answer_prompt(
    query: &str,
    understanding: &Understanding,
    plans: &[Plan],
    results: &TaskResults,
    context: &str,
) -> String {
    let mut out = String::new();
    if !context.is_empty() {
        out.push_str(context);
        out.push('\n');
    }
    let summaries: Vec<&str> = plans
        .iter()
        .map(|p| p.summary.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    if !summaries.is_empty() {
        out.push_str(&format!("Plans: {}\n", summaries.join(" | ")));
    }
    out.push_str(&format!(
        "Intent: {}\n\nTask results:\n{}\n\nUser query: {query}",
        understanding.intent,
        render_results(results)
    ));
    out
}
