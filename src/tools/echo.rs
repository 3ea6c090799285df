//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

/// 回显 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        match args.get("text") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(ToolError::InvalidArguments {
                tool: "echo".into(),
                reason: "missing \"text\"".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let out = EchoTool.execute(serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        let out = EchoTool.execute(serde_json::json!({"text": 42})).await.unwrap();
        assert_eq!(out, "42");
        assert!(matches!(
            EchoTool.execute(serde_json::json!({})).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }
}
