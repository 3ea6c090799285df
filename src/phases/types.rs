//! 阶段间传递的数据：Understanding / Plan / Task / TaskResult / Reflection
//!
//! 字段名对外（LLM JSON）使用 camelCase，同时接受 snake_case 别名。

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 查询中识别出的实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: String,
    pub value: String,
}

/// Understand 阶段输出：意图与实体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Understanding {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl Understanding {
    /// 失败、超时或跳过时的最小理解：意图即原始查询
    pub fn minimal(query: &str) -> Self {
        Self {
            intent: query.to_string(),
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    UseTools,
    Reason,
}

/// 单次工具调用：{"tool": "...", "args": {...}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, alias = "task_type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    /// 依赖边：只记录，不参与调度
    #[serde(default, alias = "depends_on")]
    pub depends_on: Vec<String>,
    #[serde(default, alias = "tool_calls")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// `iter<N>_` 形式的迭代前缀
pub fn iteration_prefix(iteration: usize) -> String {
    format!("iter{iteration}_")
}

/// 是否已带有任一迭代的命名空间前缀
fn is_namespaced(id: &str) -> bool {
    id.strip_prefix("iter")
        .and_then(|rest| rest.split_once('_'))
        .map(|(digits, _)| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

impl Plan {
    /// 把任务 id 与依赖 id 放入本轮命名空间，保证整个运行内结果键不冲突。
    ///
    /// 已带本轮前缀的 id 原样保留；同一计划内重复的 id 追加序号。空 id 保持为空（执行时跳过）。
    pub fn namespace(&mut self, iteration: usize) {
        let prefix = iteration_prefix(iteration);
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for task in &mut self.tasks {
            if task.id.trim().is_empty() {
                task.id.clear();
            } else {
                if !task.id.starts_with(&prefix) {
                    task.id = format!("{prefix}{}", task.id.trim());
                }
                if seen.contains(&task.id) {
                    let base = task.id.clone();
                    let mut n = 2;
                    while seen.contains(&format!("{base}_{n}")) {
                        n += 1;
                    }
                    task.id = format!("{base}_{n}");
                }
                seen.insert(task.id.clone());
            }
            for dep in &mut task.depends_on {
                if !is_namespaced(dep) {
                    *dep = format!("{prefix}{}", dep.trim());
                }
            }
        }
    }

    /// 按结果表同步任务状态（超时后执行器可能来不及回写状态）
    pub fn sync_statuses(&mut self, results: &TaskResults) {
        for task in &mut self.tasks {
            if let Some(r) = results.get(&task.id) {
                task.status = if r.failed {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Completed
                };
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// 单个任务的执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
    /// 本任务发起的工具调用次数（计入 RunMetrics）
    #[serde(skip)]
    pub tool_calls: usize,
}

impl TaskResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            failed: true,
            ..Default::default()
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            timeout: true,
            ..Self::failure(error)
        }
    }

    pub fn with_tool_calls(mut self, n: usize) -> Self {
        self.tool_calls = n;
        self
    }

    /// 供 prompt 渲染的一行文本
    pub fn display_text(&self) -> &str {
        match (&self.output, &self.error) {
            (Some(o), _) if !self.failed => o.as_str(),
            (_, Some(e)) => e.as_str(),
            (Some(o), None) => o.as_str(),
            (None, None) => "",
        }
    }
}

/// 运行内累积的任务结果：键为任务 id，按插入顺序遍历；整个运行期间只增不清
#[derive(Debug, Clone, Default)]
pub struct TaskResults {
    entries: BTreeMap<String, TaskResult>,
    order: Vec<String>,
}

impl TaskResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入（同 id 覆盖值，但保留首次插入位置）
    pub fn insert(&mut self, task_id: impl Into<String>, result: TaskResult) {
        let task_id = task_id.into();
        if self.entries.insert(task_id.clone(), result).is_none() {
            self.order.push(task_id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskResult> {
        self.entries.get(task_id)
    }

    pub fn contains_key(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 键集合快照（进度检测用）
    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskResult)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k.as_str(), v)))
    }

    pub fn failed_count(&self) -> usize {
        self.entries.values().filter(|r| r.failed).count()
    }

    pub fn tool_call_count(&self) -> usize {
        self.entries.values().map(|r| r.tool_calls).sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// 任务结果的接收端：执行器每完成一个任务就写入一次
pub trait ResultSink: Send {
    fn record(&mut self, task_id: &str, result: TaskResult);
}

impl ResultSink for TaskResults {
    fn record(&mut self, task_id: &str, result: TaskResult) {
        self.insert(task_id, result);
    }
}

/// 通过通道把结果交回编排器：即使 Execute 阶段超时被取消，已送出的结果仍然保留
pub struct ChannelSink(pub mpsc::UnboundedSender<(String, TaskResult)>);

impl ResultSink for ChannelSink {
    fn record(&mut self, task_id: &str, result: TaskResult) {
        let _ = self.0.send((task_id.to_string(), result));
    }
}

/// Reflect 阶段输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    #[serde(default, alias = "is_complete")]
    pub is_complete: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "missing_info")]
    pub missing_info: Vec<String>,
    #[serde(default, alias = "suggested_next_steps")]
    pub suggested_next_steps: String,
    /// 0.0 ~ 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Reflection {
    /// 失败、超时或跳过时的「无结论」反思
    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self {
            reasoning: reason.into(),
            ..Default::default()
        }
    }

    /// 下一轮 Plan 的指导文本；无可用内容时为 None
    pub fn guidance(&self) -> Option<String> {
        let mut parts = Vec::new();
        let steps = self.suggested_next_steps.trim();
        if !steps.is_empty() {
            parts.push(steps.to_string());
        }
        let missing: Vec<&str> = self
            .missing_info
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if !missing.is_empty() {
            parts.push(format!("Missing information: {}", missing.join("; ")));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            description: format!("do {id}"),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_namespace_prefixes_ids_and_deps() {
        let mut plan = Plan {
            summary: "s".into(),
            tasks: vec![task("a", &[]), task("b", &["a"])],
        };
        plan.namespace(2);
        assert_eq!(plan.tasks[0].id, "iter2_a");
        assert_eq!(plan.tasks[1].id, "iter2_b");
        assert_eq!(plan.tasks[1].depends_on, vec!["iter2_a".to_string()]);
    }

    #[test]
    fn test_namespace_is_idempotent_and_dedupes() {
        let mut plan = Plan {
            summary: String::new(),
            tasks: vec![task("iter1_a", &["iter0_x"]), task("a", &[]), task("", &[])],
        };
        plan.namespace(1);
        plan.namespace(1);
        assert_eq!(plan.tasks[0].id, "iter1_a");
        assert_eq!(plan.tasks[0].depends_on, vec!["iter0_x".to_string()]);
        assert_eq!(plan.tasks[1].id, "iter1_a_2");
        assert_eq!(plan.tasks[2].id, "");
    }

    #[test]
    fn test_task_deserializes_camel_and_snake_case() {
        let camel: Task = serde_json::from_str(
            r#"{"id":"t1","description":"x","taskType":"use_tools","dependsOn":["t0"],"toolCalls":[{"tool":"echo","args":{"text":"hi"}}]}"#,
        )
        .unwrap();
        let snake: Task = serde_json::from_str(
            r#"{"id":"t1","description":"x","task_type":"use_tools","depends_on":["t0"],"tool_calls":[{"tool":"echo","args":{"text":"hi"}}]}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.status, TaskStatus::Pending);
        assert_eq!(camel.tool_calls[0].tool, "echo");
    }

    #[test]
    fn test_task_results_keep_insertion_order() {
        let mut results = TaskResults::new();
        results.insert("iter2_b", TaskResult::ok("b"));
        results.insert("iter1_a", TaskResult::failure("boom"));
        results.insert("iter2_b", TaskResult::ok("b2"));
        let keys: Vec<&str> = results.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["iter2_b", "iter1_a"]);
        assert_eq!(results.get("iter2_b").unwrap().output.as_deref(), Some("b2"));
        assert_eq!(results.failed_count(), 1);
    }

    #[test]
    fn test_reflection_guidance() {
        let r = Reflection {
            suggested_next_steps: "look up prices".into(),
            missing_info: vec!["2023 revenue".into()],
            ..Default::default()
        };
        let g = r.guidance().unwrap();
        assert!(g.contains("look up prices"));
        assert!(g.contains("2023 revenue"));
        assert!(Reflection::inconclusive("x").guidance().is_none());
    }

    #[test]
    fn test_timed_out_result_serializes_flags() {
        let v = serde_json::to_value(TaskResult::timed_out("deadline")).unwrap();
        assert_eq!(v["failed"], true);
        assert_eq!(v["timeout"], true);
        assert_eq!(v["error"], "deadline");
    }
}
