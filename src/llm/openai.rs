//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! stop 序列在客户端截断，避免不同兼容端点对 stop 字段的差异。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{truncate_at_stop, GenerationParams, LlmClient, LlmError, Message, Role, TokenStream};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::InvalidResponse(e.to_string()))
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let model = params.model.as_deref().unwrap_or(&self.model);
        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(self.to_openai_messages(messages)?)
            .temperature(params.temperature)
            .top_p(params.top_p)
            .max_completion_tokens(params.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

/// async_openai 的错误统一转为 LlmError（按错误文本归类，不依赖具体变体）
pub(crate) fn classify_transport_error(message: String) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("error sending request")
        || lower.contains("connection refused")
        || lower.contains("dns error")
        || lower.contains("failed to connect")
    {
        LlmError::Unreachable(message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmError::Timeout(0)
    } else if lower.contains("rate limit") || lower.contains("429") {
        LlmError::RateLimited {
            retry_after_ms: 1_000,
        }
    } else {
        LlmError::ApiError(message)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let request = self.build_request(messages, params)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_transport_error(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(truncate_at_stop(&content, &params.stop))
    }

    /// 逐个 delta 输出；stop 截断由调用方在拼接后处理
    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        let request = self.build_request(messages, params)?;
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| classify_transport_error(e.to_string()))?;
        let tokens = stream.filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.clone())
                    .map(Ok),
                Err(e) => Some(Err(classify_transport_error(e.to_string()))),
            }
        });
        Ok(Box::pin(tokens))
    }
}
