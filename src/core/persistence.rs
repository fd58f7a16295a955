//! 会话检查点
//!
//! 将 SessionSnapshot 写入/从 JSON 文件加载，用于中断后由新的控制器实例恢复。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::core::SessionSnapshot;

/// 单文件 JSON 检查点
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 在目录下按 session_id 命名
    pub fn in_dir(dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{}.json", session_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading checkpoint {}", self.path.display()))?;
        let snapshot = serde_json::from_str(&data)
            .with_context(|| format!("parsing checkpoint {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// 先写临时文件再改名，父目录不存在时自动创建
    pub fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("writing checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), steps = snapshot.history.len(), "checkpoint saved");
        Ok(())
    }
}
