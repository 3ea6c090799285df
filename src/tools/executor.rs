//! 工具分发器
//!
//! 持有只读 ToolRegistry、单次调用超时与重试策略。dispatch 先校验工具存在与参数形状，
//! 再在重试包装内带超时调用工具（超时视为瞬时错误）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::retry::RetryPolicy;
use crate::phases::types::ToolCall;
use crate::tools::{ToolError, ToolRegistry};

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            registry,
            timeout,
            policy,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行一次工具调用；缺失工具与非对象参数直接失败，不进入重试
    pub async fn dispatch(&self, call: &ToolCall) -> Result<String, ToolError> {
        let start = Instant::now();
        let (result, attempts) = match self.prepare(call) {
            Ok((tool, args)) => {
                let limit = self.timeout;
                let name = call.tool.as_str();
                self.policy
                    .run_counted(&format!("tool:{name}"), || {
                        let tool = tool.clone();
                        let args = args.clone();
                        async move {
                            match timeout(limit, tool.execute(args)).await {
                                Ok(r) => r,
                                Err(_) => Err(ToolError::Timeout(format!(
                                    "{name} exceeded {}ms",
                                    limit.as_millis()
                                ))),
                            }
                        }
                    })
                    .await
            }
            Err(e) => (Err(e), 0),
        };
        audit(call, &result, attempts, start.elapsed());
        result
    }

    fn prepare(&self, call: &ToolCall) -> Result<(Arc<dyn crate::tools::Tool>, Value), ToolError> {
        let tool = self
            .registry
            .get(&call.tool)
            .ok_or_else(|| ToolError::NotFound(call.tool.clone()))?;
        let args = match &call.args {
            Value::Object(_) => call.args.clone(),
            Value::Null => Value::Object(Default::default()),
            other => {
                return Err(ToolError::InvalidArguments {
                    tool: call.tool.clone(),
                    reason: format!("args must be a JSON object, got {}", json_kind(other)),
                })
            }
        };
        Ok((tool, args))
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn audit(call: &ToolCall, result: &Result<String, ToolError>, attempts: u32, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(ToolError::Timeout(_)) => "timeout",
        Err(ToolError::NotFound(_)) => "not_found",
        Err(ToolError::InvalidArguments { .. }) => "invalid_arguments",
        Err(_) => "error",
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.tool,
        "ok": result.is_ok(),
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(&call.args),
    });
    tracing::info!(audit = %audit, "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
