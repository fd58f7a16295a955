//! 项目上下文来源
//!
//! 每轮构造 prompt 前并发收集；内容对核心是不透明文本，收集失败的来源直接略过。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextItem {
    pub name: String,
    pub text: String,
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    fn name(&self) -> &str;

    /// None 表示没有可用内容
    async fn gather(&self, request: &str) -> Option<String>;
}

/// 固定文本
pub struct StaticContext {
    name: String,
    text: String,
}

impl StaticContext {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl ContextSource for StaticContext {
    fn name(&self) -> &str {
        &self.name
    }

    async fn gather(&self, _request: &str) -> Option<String> {
        (!self.text.trim().is_empty()).then(|| self.text.clone())
    }
}

/// 读取一个文件（如 README、接口说明），超过 max_bytes 时截断
pub struct FileContext {
    path: PathBuf,
    max_bytes: usize,
}

impl FileContext {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl ContextSource for FileContext {
    fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
    }

    async fn gather(&self, _request: &str) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(mut text) => {
                if text.len() > self.max_bytes {
                    let mut cut = self.max_bytes;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                Some(text)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "context file unavailable");
                None
            }
        }
    }
}

/// 并发收集所有来源，保持来源顺序
pub async fn gather_context(sources: &[Arc<dyn ContextSource>], request: &str) -> Vec<ContextItem> {
    let results = join_all(sources.iter().map(|s| async move {
        s.gather(request).await.map(|text| ContextItem {
            name: s.name().to_string(),
            text,
        })
    }))
    .await;
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gather_keeps_order_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let readme = dir.path().join("README.md");
        std::fs::write(&readme, "Use only the standard library.").unwrap();

        let sources: Vec<Arc<dyn ContextSource>> = vec![
            Arc::new(StaticContext::new("style", "PEP 8")),
            Arc::new(FileContext::new(dir.path().join("missing.txt"), 100)),
            Arc::new(FileContext::new(&readme, 8)),
            Arc::new(StaticContext::new("empty", "  ")),
        ];
        let items = gather_context(&sources, "anything").await;
        assert_eq!(
            items,
            vec![
                ContextItem {
                    name: "style".into(),
                    text: "PEP 8".into()
                },
                ContextItem {
                    name: "README.md".into(),
                    text: "Use only".into()
                },
            ]
        );
    }
}
