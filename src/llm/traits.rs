//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Ollama / Mock）实现 LlmClient：
//! complete（chat，非流式）、complete_stream（流式 Token）、generate（单 prompt）。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::llm::{GenerationParams, Message};

/// 流式输出：逐段返回文本
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 后端错误。核心层只关心「是否可达」与「是否值得重试」，其余按不透明字符串处理
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 连接失败 / DNS / 拒绝连接
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Timeout(_) | LlmError::RateLimited { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, LlmError::Unreachable(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 当前使用的模型名
    fn model_name(&self) -> &str;

    /// 非流式 chat 完成
    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流；默认把 complete 的结果作为单个分片
    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages, params).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(content)])))
    }

    /// 单 prompt 生成；默认包装为一条 user 消息
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, LlmError> {
        self.complete(&[Message::user(prompt)], params).await
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 把流式分片拼接为完整文本；任一分片出错即返回错误
pub async fn collect_stream(mut stream: TokenStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

/// 重试配置：仅对 Timeout / RateLimited 重试，指数退避
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        let backoff = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        let ms = match err {
            LlmError::RateLimited { retry_after_ms } => (*retry_after_ms).max(backoff),
            _ => backoff,
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// 带重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages, params).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay_for(attempt, &e);
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM call failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        // 流一旦开始无法安全重放，只对建立连接阶段重试
        let mut attempt = 0;
        loop {
            match self.inner.complete_stream(messages, params).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    tokio::time::sleep(self.config.delay_for(attempt, &e)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(prompt, params).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.delay_for(attempt, &e);
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM generate failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
