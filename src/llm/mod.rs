//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Ollama / Mock）

pub mod deepseek;
pub mod message;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use message::{truncate_at_stop, GenerationParams, Message, Role};
pub use mock::MockLlmClient;
pub use ollama::{OllamaClient, OLLAMA_BASE_URL};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{collect_stream, LlmClient, LlmError, RetryConfig, RetryingLlmClient, TokenStream};

use crate::config::{LlmSection, Provider};

/// 按 [llm] 配置创建客户端；max_retries > 0 时包装重试
///
/// api_key 只从配置读取（可由 CODELOOP__LLM__API_KEY 覆盖），缺失时对需要密钥的后端报错。
pub fn create_llm_from_config(section: &LlmSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    let base: Arc<dyn LlmClient> = match section.provider {
        Provider::Mock => Arc::new(MockLlmClient::new()),
        Provider::OpenAi => {
            let key = require_api_key(section)?;
            Arc::new(OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                key,
            ))
        }
        Provider::DeepSeek => {
            let key = require_api_key(section)?;
            Arc::new(create_deepseek_client(
                section.base_url.as_deref(),
                Some(section.model.as_str()),
                key,
            ))
        }
        Provider::Ollama => Arc::new(OllamaClient::new(
            section.base_url.as_deref(),
            &section.model,
            section.timeouts.request,
        )?),
    };

    tracing::info!(
        provider = ?section.provider,
        model = base.model_name(),
        max_retries = section.max_retries,
        "LLM backend created"
    );

    if section.max_retries == 0 {
        return Ok(base);
    }
    Ok(Arc::new(RetryingLlmClient::new(
        base,
        RetryConfig {
            max_retries: section.max_retries,
            ..RetryConfig::default()
        },
    )))
}

fn require_api_key(section: &LlmSection) -> Result<&str, LlmError> {
    section
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            LlmError::ApiError(format!(
                "provider {:?} requires llm.api_key (or CODELOOP__LLM__API_KEY)",
                section.provider
            ))
        })
}
