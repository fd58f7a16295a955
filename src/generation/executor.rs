//! 执行校验：调用沙箱并把结果归类为 Verdict

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::core::StepError;
use crate::generation::prompt::describe_error;
use crate::generation::sandbox::ExecutionSandbox;
use crate::generation::types::{Candidate, ErrorDetail, ExecutionOutcome, Verdict};

#[derive(Clone)]
pub struct ExecutionVerifier {
    sandbox: Arc<dyn ExecutionSandbox>,
    timeout: Duration,
}

impl ExecutionVerifier {
    pub fn new(sandbox: Arc<dyn ExecutionSandbox>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 沙箱故障时 outcome 为 None
    pub async fn verify(&self, candidate: &Candidate) -> (Verdict, Option<ExecutionOutcome>) {
        match self.sandbox.run(candidate, self.timeout).await {
            Ok(outcome) => {
                let verdict = classify(&outcome, self.timeout);
                (verdict, Some(outcome))
            }
            Err(e) => {
                tracing::warn!(error = %e, "sandbox failure");
                (
                    Verdict::SandboxFailure {
                        message: e.to_string(),
                    },
                    None,
                )
            }
        }
    }
}

pub fn classify(outcome: &ExecutionOutcome, timeout: Duration) -> Verdict {
    if outcome.timed_out {
        Verdict::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if outcome.exit_code == 0 {
        Verdict::Passed
    } else {
        Verdict::Failed {
            error: parse_error(&outcome.stderr, outcome.exit_code),
        }
    }
}

/// 未通过的判定对应的可恢复错误
pub fn verdict_error(verdict: &Verdict) -> Option<StepError> {
    match verdict {
        Verdict::Passed => None,
        Verdict::TimedOut { timeout_ms } => Some(StepError::ExecutionTimeout(*timeout_ms)),
        Verdict::Failed { error } => Some(StepError::ExecutionError(error.to_string())),
        Verdict::SandboxFailure { message } => Some(StepError::Sandbox(message.clone())),
    }
}

/// 修复 prompt 中的错误描述；失败时附带 stderr 尾部
pub fn failure_text(verdict: &Verdict, outcome: Option<&ExecutionOutcome>) -> String {
    match verdict {
        Verdict::Passed => String::new(),
        Verdict::TimedOut { timeout_ms } => format!(
            "The program was killed after running for {}ms without finishing. \
            It must terminate on its own and must not wait for input.",
            timeout_ms
        ),
        Verdict::Failed { error } => {
            describe_error(error, outcome.map(|o| o.stderr.as_str()).unwrap_or(""))
        }
        Verdict::SandboxFailure { message } => format!("The sandbox failed: {}", message),
    }
}

fn file_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\s*File "([^"]+)", line (\d+)"#).expect("valid regex"))
}

fn exception_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][\w.]*)(?::\s*(.*))?$").expect("valid regex")
    })
}

/// 解析 Python traceback：最后一个 File 行给出位置，最后一行未缩进文本给出异常
pub fn parse_traceback(stderr: &str) -> Option<ErrorDetail> {
    let lines: Vec<&str> = stderr.lines().collect();
    let mut location = None;
    for line in &lines {
        if let Some(caps) = file_line_regex().captures(line) {
            location = Some((caps[1].to_string(), caps[2].parse::<usize>().ok()));
        }
    }
    let is_traceback = location.is_some() || stderr.contains("Traceback (most recent call last)");
    if !is_traceback {
        return None;
    }
    let last = lines
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty() && !l.starts_with(' ') && !l.starts_with('\t'))?;
    let caps = exception_regex().captures(last.trim_end())?;
    let (file, line) = match location {
        Some((file, line)) => (Some(display_path(&file)), line),
        None => (None, None),
    };
    Some(ErrorDetail {
        kind: caps[1].to_string(),
        message: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        file,
        line,
    })
}

/// 非 Python 错误退化为 stderr 最后一行
pub fn parse_error(stderr: &str, exit_code: i32) -> ErrorDetail {
    if let Some(detail) = parse_traceback(stderr) {
        return detail;
    }
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("process exited with code {}", exit_code));
    ErrorDetail {
        kind: "ExecutionError".to_string(),
        message,
        file: None,
        line: None,
    }
}

/// 沙箱里的绝对路径只保留文件名
fn display_path(file: &str) -> String {
    let path = Path::new(file);
    if path.is_absolute() {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(file)
            .to_string()
    } else {
        file.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SandboxError;
    use async_trait::async_trait;

    #[test]
    fn test_runtime_traceback() {
        let stderr = r#"Traceback (most recent call last):
  File "main.py", line 7, in <module>
    main()
  File "main.py", line 4, in main
    print(totl)
NameError: name 'totl' is not defined
"#;
        let d = parse_traceback(stderr).unwrap();
        assert_eq!(d.kind, "NameError");
        assert_eq!(d.message, "name 'totl' is not defined");
        assert_eq!(d.file.as_deref(), Some("main.py"));
        assert_eq!(d.line, Some(4));
    }

    #[test]
    fn test_syntax_error_traceback() {
        let stderr = "  File \"/tmp/codeloop-abc/main.py\", line 2\n    def f(\n         ^\nSyntaxError: '(' was never closed\n";
        let d = parse_traceback(stderr).unwrap();
        assert_eq!(d.kind, "SyntaxError");
        assert_eq!(d.file.as_deref(), Some("main.py"));
        assert_eq!(d.line, Some(2));
    }

    #[test]
    fn test_exception_without_message() {
        let stderr = "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nKeyboardInterrupt\n";
        let d = parse_traceback(stderr).unwrap();
        assert_eq!(d.kind, "KeyboardInterrupt");
        assert_eq!(d.message, "");
    }

    #[test]
    fn test_verdict_error_mapping() {
        assert_eq!(verdict_error(&Verdict::Passed), None);
        assert_eq!(
            verdict_error(&Verdict::TimedOut { timeout_ms: 10 }),
            Some(StepError::ExecutionTimeout(10))
        );
        let failed = Verdict::Failed {
            error: ErrorDetail {
                kind: "ValueError".into(),
                message: "bad".into(),
                file: Some("main.py".into()),
                line: Some(3),
            },
        };
        assert_eq!(
            verdict_error(&failed),
            Some(StepError::ExecutionError("ValueError: bad (at main.py:3)".into()))
        );
        assert!(failure_text(&failed, None).starts_with("ValueError: bad"));
    }

    #[test]
    fn test_non_python_falls_back_to_last_line() {
        let d = parse_error("warming up\nsh: 1: frobnicate: not found\n", 127);
        assert_eq!(d.kind, "ExecutionError");
        assert_eq!(d.message, "sh: 1: frobnicate: not found");
        assert!(parse_error("", 2).message.contains("code 2"));
    }

    struct FixedSandbox(Result<ExecutionOutcome, ()>);

    #[async_trait]
    impl ExecutionSandbox for FixedSandbox {
        async fn run(&self, _c: &Candidate, _t: Duration) -> Result<ExecutionOutcome, SandboxError> {
            self.0.clone().map_err(|_| SandboxError::EmptyCandidate)
        }
    }

    fn outcome(exit_code: i32, stderr: &str, timed_out: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::from_millis(5),
            timed_out,
        }
    }

    #[tokio::test]
    async fn test_verdicts() {
        let candidate = Candidate::single("main.py", "x");
        let timeout = Duration::from_secs(1);

        let v = ExecutionVerifier::new(Arc::new(FixedSandbox(Ok(outcome(0, "", false)))), timeout);
        assert_eq!(v.verify(&candidate).await.0, Verdict::Passed);

        let v = ExecutionVerifier::new(Arc::new(FixedSandbox(Ok(outcome(124, "", true)))), timeout);
        assert_eq!(v.verify(&candidate).await.0, Verdict::TimedOut { timeout_ms: 1000 });

        let v = ExecutionVerifier::new(
            Arc::new(FixedSandbox(Ok(outcome(1, "ValueError: bad\n", false)))),
            timeout,
        );
        match v.verify(&candidate).await.0 {
            Verdict::Failed { error } => assert_eq!(error.message, "ValueError: bad"),
            other => panic!("unexpected verdict {:?}", other),
        }

        let v = ExecutionVerifier::new(Arc::new(FixedSandbox(Err(()))), timeout);
        let (verdict, out) = v.verify(&candidate).await;
        assert!(matches!(verdict, Verdict::SandboxFailure { .. }));
        assert!(!verdict.is_fixable());
        assert!(out.is_none());
    }
}
