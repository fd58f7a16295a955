//! 错误类型与恢复动作
//!
//! StepError 是单轮迭代 / 单次修复内的可恢复错误，只结束当前轮次；
//! RunError 是整个请求的致命错误；SandboxError 是沙箱自身（而非被执行代码）的故障。
//! 与 RecoveryEngine 配合：根据 StepError 决定 RetryWithPrompt / NextIteration / Abort。

use thiserror::Error;

use crate::llm::LlmError;

/// 单轮内的可恢复错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// 模型回复中没有可用代码
    #[error("Extraction failure: {}", .0.join("; "))]
    ExtractionFailure(Vec<String>),

    /// 候选无法解析且修复失败
    #[error("Syntax error: {0}")]
    SyntaxError(String),

    /// 补全后仍有桩函数
    #[error("Incomplete functions unresolved: {}", .0.join(", "))]
    IncompleteFunctionUnresolved(Vec<String>),

    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Backend error: {0}")]
    BackendError(LlmError),

    #[error("Sandbox failure: {0}")]
    Sandbox(String),
}

impl StepError {
    /// 写入历史时使用的短名称
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::ExtractionFailure(_) => "extraction_failure",
            StepError::SyntaxError(_) => "syntax_error",
            StepError::IncompleteFunctionUnresolved(_) => "incomplete_function_unresolved",
            StepError::ExecutionTimeout(_) => "execution_timeout",
            StepError::ExecutionError(_) => "execution_error",
            StepError::BackendError(_) => "backend_error",
            StepError::Sandbox(_) => "sandbox_failure",
        }
    }
}

/// 整个请求的致命错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    /// 第一次调用模型即不可达，不再消耗迭代预算
    #[error("Model backend unreachable: {0}")]
    BackendUnreachable(String),

    /// 预算耗尽且没有任何候选得分大于 0；携带全部问题
    #[error("No valid candidate after {iterations} iteration(s): {}", .issues.join("; "))]
    NoValidCandidate {
        iterations: usize,
        issues: Vec<String>,
    },

    /// 收到关闭信号；会话未完成，可从检查点恢复
    #[error("Cancelled after {0} completed iteration(s)")]
    Cancelled(usize),
}

/// 沙箱自身的故障（无法写文件、无法启动解释器等）
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Candidate has no files")]
    EmptyCandidate,

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮 prompt
    RetryWithPrompt(String),
    /// 不附加提示，直接进入下一轮
    NextIteration,
    /// 终止当前请求
    Abort,
}
