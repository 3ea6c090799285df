//! DeepSeek（OpenAI 兼容格式）
//!
//! 默认 Base URL https://api.deepseek.com，可由 [llm].base_url 覆盖；
//! deepseek-chat 用于各推理阶段，deepseek-reasoner 可用于更难的规划。

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端；模型依次取参数、`DEEPSEEK_MODEL`、`deepseek-chat`
pub fn create_deepseek_client(model: Option<&str>, base_url: Option<&str>) -> OpenAiClient {
    let api_key = deepseek_api_key().unwrap_or_else(|| "sk-placeholder".to_string());
    let model = model
        .filter(|m| !m.trim().is_empty())
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
    let base_url = base_url.unwrap_or(DEEPSEEK_BASE_URL);
    tracing::debug!(model = %model, base_url = %base_url, "deepseek client");
    OpenAiClient::new(Some(base_url), &model, Some(api_key.as_str()))
}

/// `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`；空串视为未设置
pub fn deepseek_api_key() -> Option<String> {
    ["DEEPSEEK_API_KEY", "OPENAI_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.trim().is_empty())
}
