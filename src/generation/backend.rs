//! 模型调用封装：采样参数、单次调用超时与可选流式拼接

use std::sync::Arc;
use std::time::Duration;

use crate::llm::{collect_stream, truncate_at_stop, GenerationParams, LlmClient, LlmError, Message};

#[derive(Clone)]
pub struct ModelBackend {
    client: Arc<dyn LlmClient>,
    params: GenerationParams,
    timeout: Duration,
    stream: bool,
}

impl ModelBackend {
    pub fn new(client: Arc<dyn LlmClient>, params: GenerationParams, timeout: Duration) -> Self {
        Self {
            client,
            params,
            timeout,
            stream: false,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// 使用流式接口，分片拼接后再交给提取器
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// 超时后丢弃未完成的请求（连接随 future 一起释放）
    pub async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let call = async {
            if self.stream {
                let messages = [Message::user(prompt)];
                let stream = self.client.complete_stream(&messages, &self.params).await?;
                collect_stream(stream).await
            } else {
                self.client.generate(prompt, &self.params).await
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map(|text| truncate_at_stop(&text, &self.params.stop)),
            Err(_) => Err(LlmError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use async_trait::async_trait;

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _params: &GenerationParams,
        ) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let backend = ModelBackend::new(
            Arc::new(SlowClient),
            GenerationParams::default(),
            Duration::from_millis(50),
        );
        let err = backend.generate("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stream_and_stop_sequences() {
        let mock = MockLlmClient::scripted(vec![Ok("print(1)\nEND\nnoise".into())]).with_chunk_chars(2);
        let params = GenerationParams {
            stop: vec!["END".into()],
            ..GenerationParams::default()
        };
        let backend =
            ModelBackend::new(Arc::new(mock), params, Duration::from_secs(5)).with_stream(true);
        assert_eq!(backend.generate("x").await.unwrap(), "print(1)\n");
    }
}
