//! 结构化输出：把 schemars 生成的 JSON Schema 注入 system prompt，并分层解析模型输出
//!
//! 解析顺序：原样 → 去掉 ``` 代码围栏 → 提取第一个括号平衡的 {...} → 修复常见语法问题；
//! 全部失败时返回 MalformedOutput，由调用方回退到最小默认值。

use std::sync::OnceLock;

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

/// 返回类型 T 的 JSON Schema 字符串，可拼入 system prompt
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 分层解析为 JSON 值
pub fn parse_structured(raw: &str) -> Result<Value, LlmError> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }

    let unfenced = strip_fences(trimmed);
    if let Some(body) = unfenced {
        if let Ok(v) = serde_json::from_str::<Value>(body) {
            return Ok(v);
        }
    }

    let source = unfenced.unwrap_or(trimmed);
    let candidate = extract_object(source);
    if let Some(obj) = candidate {
        if let Ok(v) = serde_json::from_str::<Value>(obj) {
            return Ok(v);
        }
    }

    let repaired = repair(candidate.unwrap_or(source));
    serde_json::from_str::<Value>(&repaired).map_err(|e| {
        LlmError::MalformedOutput(format!("{e}: {}", preview(trimmed)))
    })
}

/// 分层解析并反序列化为 T
pub fn parse_as<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let value = parse_structured(raw)?;
    serde_json::from_value(value).map_err(|e| LlmError::MalformedOutput(e.to_string()))
}

/// 调用 LLM 并解析为 T；schema 会附加到 system prompt 末尾
pub async fn complete_structured<T>(
    llm: &dyn LlmClient,
    request: CompletionRequest,
) -> Result<T, LlmError>
where
    T: JsonSchema + DeserializeOwned + Send,
{
    let schema = schema_json::<T>();
    let system = format!(
        "{}\n\nRespond with a single JSON object matching this schema:\n{}",
        request.system_prompt.as_deref().unwrap_or(""),
        schema
    );
    let request = CompletionRequest {
        system_prompt: Some(system.trim_start().to_string()),
        ..request
    };
    let raw = llm.complete(&request).await?;
    parse_as::<T>(&raw)
}

/// 同 complete_structured，但输出无法解析时回退到 fallback（其他错误仍返回）
pub async fn complete_structured_or<T>(
    llm: &dyn LlmClient,
    request: CompletionRequest,
    fallback: T,
) -> Result<T, LlmError>
where
    T: JsonSchema + DeserializeOwned + Send,
{
    match complete_structured::<T>(llm, request).await {
        Ok(v) => Ok(v),
        Err(LlmError::MalformedOutput(e)) => {
            tracing::warn!(error = %e, "structured output unparseable, using fallback");
            Ok(fallback)
        }
        Err(e) => Err(e),
    }
}

/// 去掉 ```json ... ``` 或 ``` ... ``` 围栏，返回围栏内内容
fn strip_fences(s: &str) -> Option<&str> {
    let start = s.find("```")?;
    let after = &s[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let lang = after[..body_start].trim();
    let body = if lang.chars().all(|c| c.is_ascii_alphanumeric()) {
        &after[body_start..]
    } else {
        after
    };
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim())
}

/// 第一个括号平衡的 {...}（忽略字符串内的括号与转义）
fn extract_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in s[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn trailing_comma() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").ok()).as_ref()
}

fn python_literal() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(None|True|False)\b").ok()).as_ref()
}

/// 修复：单引号字符串 → 双引号字符串、尾逗号、Python 字面量。
/// 后两项只作用于字符串之外的片段，字符串内容原样保留。
fn repair(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut code = String::new();
    let mut chars = s.trim().chars();
    while let Some(ch) = chars.next() {
        if ch != '"' && ch != '\'' {
            code.push(ch);
            continue;
        }
        out.push_str(&repair_code(&std::mem::take(&mut code)));
        out.push('"');
        let mut escaped = false;
        for c in chars.by_ref() {
            if escaped {
                escaped = false;
                if c == '\'' {
                    out.pop();
                }
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                _ if c == ch => break,
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            }
        }
        out.push('"');
    }
    out.push_str(&repair_code(&code));
    out
}

/// 字符串之外的片段：去尾逗号，None/True/False → null/true/false
fn repair_code(code: &str) -> String {
    let mut out = code.to_string();
    if let Some(re) = trailing_comma() {
        out = re.replace_all(&out, "$1").into_owned();
    }
    if let Some(re) = python_literal() {
        out = re
            .replace_all(&out, |caps: &regex::Captures| match &caps[1] {
                "None" => "null",
                "True" => "true",
                _ => "false",
            })
            .into_owned();
    }
    out
}

fn preview(s: &str) -> String {
    if s.chars().count() > 120 {
        format!("{}...", s.chars().take(120).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_as_is() {
        assert_eq!(parse_structured(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_fenced() {
        let raw = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\nthanks";
        assert_eq!(parse_structured(raw).unwrap(), json!({"a": [1, 2]}));
    }

    #[test]
    fn test_parse_embedded_object_with_braces_in_strings() {
        let raw = r#"Answer: {"text": "use } carefully", "n": {"m": 2}} trailing {"x": 1}"#;
        assert_eq!(
            parse_structured(raw).unwrap(),
            json!({"text": "use } carefully", "n": {"m": 2}})
        );
    }

    #[test]
    fn test_repair_trailing_comma() {
        let raw = "here is json: {\"a\":1,}";
        assert_eq!(parse_structured(raw).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_repair_python_style() {
        let raw = "{'done': True, 'missing': None, 'items': ['x', 'y',],}";
        assert_eq!(
            parse_structured(raw).unwrap(),
            json!({"done": true, "missing": null, "items": ["x", "y"]})
        );
    }

    #[test]
    fn test_repair_leaves_string_contents_alone() {
        let raw = "{'m': 'It is True, ]', 'ok': True, 'who': 'O\\'Neil', 'q': 'say \"hi\"',}";
        assert_eq!(
            parse_structured(raw).unwrap(),
            json!({"m": "It is True, ]", "ok": true, "who": "O'Neil", "q": "say \"hi\""})
        );

        let raw = r#"{"note": "None of these, }", "v": None,}"#;
        assert_eq!(
            parse_structured(raw).unwrap(),
            json!({"note": "None of these, }", "v": null})
        );
    }

    #[test]
    fn test_unparseable_is_malformed() {
        assert!(matches!(
            parse_structured("no json here at all"),
            Err(LlmError::MalformedOutput(_))
        ));
    }

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Verdict {
        ok: bool,
    }

    #[tokio::test]
    async fn test_complete_structured_or_falls_back() {
        let llm = MockLlmClient::new().with_rule("judge", "not json");
        let v = complete_structured_or(
            &llm,
            CompletionRequest::new("judge this"),
            Verdict { ok: false },
        )
        .await
        .unwrap();
        assert_eq!(v, Verdict { ok: false });

        let llm = MockLlmClient::new().with_rule("judge", "```json\n{\"ok\": true}\n```");
        let v: Verdict = complete_structured(&llm, CompletionRequest::new("judge this"))
            .await
            .unwrap();
        assert!(v.ok);
    }
}
