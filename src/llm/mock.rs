//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 两种模式：
//! - 回显：取最后一条 User 消息，生成一段打印该请求的 Python 代码块
//! - 脚本：按顺序返回预设的回复 / 错误，脚本耗尽后回退到回显

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{GenerationParams, LlmClient, LlmError, Message, Role, TokenStream};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
    /// 流式输出时每个分片的字符数（0 表示整段）
    chunk_chars: usize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定结果
    pub fn scripted(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// 流式输出时按固定字符数切分
    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars;
        self
    }

    /// 已收到的 prompt（按调用顺序，仅取最后一条 user 消息）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn next_response(&self, last_user: &str) -> Result<String, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(last_user.to_string());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(r) => r,
            None => Ok(echo_program(last_user)),
        }
    }
}

fn echo_program(request: &str) -> String {
    let first_line = request.lines().find(|l| !l.trim().is_empty()).unwrap_or("(no input)");
    let escaped = first_line.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "```python\ndef main():\n    print(\"Echo from Mock: {}\")\n\n\nif __name__ == \"__main__\":\n    main()\n```",
        escaped
    )
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        messages: &[Message],
        _params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        self.next_response(last_user)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages, params).await?;
        if self.chunk_chars == 0 {
            return Ok(Box::pin(stream::iter(vec![Ok(content)])));
        }
        let chars: Vec<char> = content.chars().collect();
        let chunks: Vec<Result<String, LlmError>> = chars
            .chunks(self.chunk_chars)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::collect_stream;

    #[tokio::test]
    async fn test_echo_mode_returns_fenced_code() {
        let client = MockLlmClient::new();
        let out = client
            .generate("print a greeting", &GenerationParams::default())
            .await
            .unwrap();
        assert!(out.starts_with("```python"));
        assert!(out.contains("print a greeting"));
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let client = MockLlmClient::scripted(vec![Err(LlmError::Timeout(3))]);
        let params = GenerationParams::default();
        assert!(client.generate("a", &params).await.is_err());
        assert!(client.generate("b", &params).await.is_ok());
        assert_eq!(client.prompts(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_chunks_reassemble() {
        let client = MockLlmClient::scripted(vec![Ok("hello world".into())]).with_chunk_chars(3);
        let stream = client
            .complete_stream(&[Message::user("x")], &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), "hello world");
    }
}
