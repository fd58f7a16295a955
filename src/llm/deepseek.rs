//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 完全兼容的 API 接口。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)
//!
//! deepseek-reasoner 的回复常带 `<think>` 段，提取器会先剥离。

use crate::llm::OpenAiClient;

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端；model 为空时用 deepseek-chat，base_url 为空时用官方端点
pub fn create_deepseek_client(
    base_url: Option<&str>,
    model: Option<&str>,
    api_key: &str,
) -> OpenAiClient {
    let model = model.filter(|m| !m.is_empty()).unwrap_or(DEEPSEEK_CHAT);
    OpenAiClient::new(Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)), model, api_key)
}
