//! Ollama 本地模型客户端
//!
//! 直接走 HTTP（reqwest）：
//! - `/api/generate`：单 prompt 生成，支持 top_k / stop 等原生 options
//! - `/api/chat`：多轮消息
//! - 流式：`stream: true` 时返回 NDJSON，每行一个分片，`done: true` 结束

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::llm::{GenerationParams, LlmClient, LlmError, Message, TokenStream};

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

impl OllamaClient {
    pub fn new(base_url: Option<&str>, model: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(OLLAMA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            timeout_secs,
        })
    }

    fn options(params: &GenerationParams) -> serde_json::Value {
        json!({
            "temperature": params.temperature,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "num_predict": params.max_tokens,
            "stop": params.stop,
        })
    }

    fn model_for<'a>(&'a self, params: &'a GenerationParams) -> &'a str {
        params.model.as_deref().unwrap_or(&self.model)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            LlmError::Unreachable(e.to_string())
        } else {
            LlmError::ApiError(e.to_string())
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after_ms: 1_000,
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!("HTTP {}: {}", status, text)));
        }
        Ok(resp)
    }

    fn chat_body(&self, messages: &[Message], params: &GenerationParams, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        json!({
            "model": self.model_for(params),
            "messages": messages,
            "stream": stream,
            "options": Self::options(params),
        })
    }
}

/// 解析一行 NDJSON 分片，返回 (文本, 是否结束)
fn parse_stream_line(line: &[u8]) -> Result<(String, bool), LlmError> {
    let chunk: ChatResponse = serde_json::from_slice(line)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream chunk: {}", e)))?;
    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok((text, chunk.done))
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model_for(params),
            "prompt": prompt,
            "stream": false,
            "options": Self::options(params),
        });
        let resp = self.post("/api/generate", body).await?;
        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<String, LlmError> {
        let resp = self.post("/api/chat", self.chat_body(messages, params, false)).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<TokenStream, LlmError> {
        let resp = self.post("/api/chat", self.chat_body(messages, params, true)).await?;
        let timeout_secs = self.timeout_secs;
        let bytes = Box::pin(resp.bytes_stream());

        let stream = futures_util::stream::unfold(
            (bytes, Vec::<u8>::new(), false),
            move |(mut inner, mut buf, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = line.trim_ascii();
                        if line.is_empty() {
                            continue;
                        }
                        return match parse_stream_line(line) {
                            Ok((text, done)) => Some((Ok(text), (inner, buf, done))),
                            Err(e) => Some((Err(e), (inner, buf, true))),
                        };
                    }
                    match inner.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            let err = if e.is_timeout() {
                                LlmError::Timeout(timeout_secs)
                            } else {
                                LlmError::ApiError(e.to_string())
                            };
                            return Some((Err(err), (inner, buf, true)));
                        }
                        None => {
                            let rest: Vec<u8> = std::mem::take(&mut buf);
                            let rest = rest.trim_ascii();
                            if rest.is_empty() {
                                return None;
                            }
                            return match parse_stream_line(rest) {
                                Ok((text, _)) => Some((Ok(text), (inner, buf, true))),
                                Err(e) => Some((Err(e), (inner, buf, true))),
                            };
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_line() {
        let (text, done) =
            parse_stream_line(br#"{"message":{"role":"assistant","content":"def"},"done":false}"#)
                .unwrap();
        assert_eq!(text, "def");
        assert!(!done);

        let (text, done) = parse_stream_line(br#"{"done":true}"#).unwrap();
        assert!(text.is_empty());
        assert!(done);
    }

    #[test]
    fn test_parse_stream_line_rejects_garbage() {
        assert!(matches!(
            parse_stream_line(b"not json"),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_options_carry_sampling_params() {
        let params = GenerationParams {
            top_k: 7,
            stop: vec!["```\n\n".into()],
            ..GenerationParams::default()
        };
        let opts = OllamaClient::options(&params);
        assert_eq!(opts["top_k"], 7);
        assert_eq!(opts["stop"][0], "```\n\n");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_classified() {
        // 端口 9 (discard) 在测试环境中通常没有监听
        let client = OllamaClient::new(Some("http://127.0.0.1:9"), "llama3", 2).unwrap();
        let err = client
            .generate("hi", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(err.is_unreachable() || matches!(err, LlmError::Timeout(_)));
    }
}
