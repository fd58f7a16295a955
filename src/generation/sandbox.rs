//! 执行沙箱
//!
//! ProcessSandbox 把候选写入临时目录，用解释器启动入口文件；超时后杀掉整个进程组。
//! 临时目录在 run 返回时删除。

use std::path::{Component, Path};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::SandboxSection;
use crate::core::SandboxError;
use crate::generation::types::{Candidate, ExecutionOutcome};

/// 超时时报告的合成退出码（与 coreutils timeout 一致）
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// 进程结束后等待输出读完的最长时间
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn run(&self, candidate: &Candidate, timeout: Duration) -> Result<ExecutionOutcome, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub args: Vec<String>,
    pub entry_file: String,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from(&SandboxSection::default())
    }
}

impl From<&SandboxSection> for SandboxConfig {
    fn from(s: &SandboxSection) -> Self {
        Self {
            interpreter: s.interpreter.clone(),
            args: s.args.clone(),
            entry_file: s.entry_file.clone(),
            max_output_bytes: s.max_output_bytes,
        }
    }
}

/// 子进程沙箱
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    async fn write_candidate(&self, root: &Path, candidate: &Candidate) -> Result<(), SandboxError> {
        for (path, source) in candidate.files() {
            check_relative(path)?;
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, source).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionSandbox for ProcessSandbox {
    async fn run(&self, candidate: &Candidate, timeout: Duration) -> Result<ExecutionOutcome, SandboxError> {
        if candidate.is_empty() {
            return Err(SandboxError::EmptyCandidate);
        }
        let entry = candidate
            .entry(&self.config.entry_file)
            .ok_or(SandboxError::EmptyCandidate)?;

        let dir = tempfile::Builder::new().prefix("codeloop-").tempdir()?;
        self.write_candidate(dir.path(), candidate).await?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.args)
            .arg(entry)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: self.config.interpreter.clone(),
            source,
        })?;

        let cap = self.config.max_output_bytes;
        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let readers = [
            child.stdout.take().map(|r| spawn_reader(r, Arc::clone(&stdout_buf))),
            child.stderr.take().map(|r| spawn_reader(r, Arc::clone(&stderr_buf))),
        ];

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "execution timed out, killing process group");
                if let Some(pid) = child.id() {
                    kill_process_group(pid).await;
                }
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "child already exited");
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };
        let duration = start.elapsed();

        for handle in readers.into_iter().flatten() {
            if tokio::time::timeout(OUTPUT_GRACE, handle).await.is_err() {
                tracing::debug!("output reader did not finish within grace period");
            }
        }

        let outcome = ExecutionOutcome {
            exit_code,
            stdout: take_text(&stdout_buf),
            stderr: take_text(&stderr_buf),
            duration,
            timed_out,
        };
        tracing::debug!(
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            duration_ms = duration.as_millis() as u64,
            "sandbox run finished"
        );
        Ok(outcome)
    }
}

/// 只接受不越出沙箱目录的相对路径
pub fn check_relative(path: &str) -> Result<(), SandboxError> {
    let p = Path::new(path);
    let escapes = p.is_absolute()
        || p.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
    if escapes || path.trim().is_empty() {
        return Err(SandboxError::PathEscape(path.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// 超出上限的部分继续读掉并丢弃，避免子进程因管道写满而阻塞
fn spawn_reader<R>(mut reader: R, buf: Arc<Mutex<CappedBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buf.lock() {
                        b.push(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_text(buf: &Arc<Mutex<CappedBuffer>>) -> String {
    match buf.lock() {
        Ok(b) => {
            let mut text = String::from_utf8_lossy(&b.data).into_owned();
            if b.truncated {
                text.push_str("\n[output truncated]");
            }
            text
        }
        Err(_) => String::new(),
    }
}

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!(pid, error = %e, "failed to kill process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_sandbox(max_output_bytes: usize) -> ProcessSandbox {
        ProcessSandbox::new(SandboxConfig {
            interpreter: "sh".into(),
            args: Vec::new(),
            entry_file: "main.sh".into(),
            max_output_bytes,
        })
    }

    #[tokio::test]
    async fn test_successful_run_captures_output() {
        let sandbox = sh_sandbox(4096);
        let candidate = Candidate::single("main.sh", "echo hello\necho oops >&2\n");
        let out = sandbox.run(&candidate, Duration::from_secs(5)).await.unwrap();
        assert!(out.succeeded());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let sandbox = sh_sandbox(4096);
        let out = sandbox
            .run(&Candidate::single("main.sh", "exit 3\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let sandbox = sh_sandbox(4096);
        let started = Instant::now();
        let out = sandbox
            .run(
                &Candidate::single("main.sh", "sleep 30\necho done\n"),
                Duration::from_millis(300),
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!out.stdout.contains("done"));
    }

    #[tokio::test]
    async fn test_multi_file_candidate_runs_entry() {
        let sandbox = sh_sandbox(4096);
        let mut candidate = Candidate::new();
        candidate.insert("lib/helper.sh", "greet() { echo \"hi $1\"; }\n");
        candidate.insert("main.sh", ". ./lib/helper.sh\ngreet there\n");
        let out = sandbox.run(&candidate, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout.trim(), "hi there");
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let sandbox = sh_sandbox(16);
        let out = sandbox
            .run(
                &Candidate::single("main.sh", "i=0\nwhile [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done\n"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(out.succeeded());
        assert!(out.stdout.starts_with("0123456789\n01234"));
        assert!(out.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_path_escape_is_rejected() {
        let sandbox = sh_sandbox(4096);
        let err = sandbox
            .run(&Candidate::single("../evil.sh", "echo x\n"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let sandbox = ProcessSandbox::new(SandboxConfig {
            interpreter: "definitely-not-an-interpreter".into(),
            ..SandboxConfig::default()
        });
        let err = sandbox
            .run(&Candidate::single("main.py", "print(1)\n"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }
}
