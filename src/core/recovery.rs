//! 错误恢复引擎
//!
//! 根据 StepError 类型返回 RecoveryAction，供迭代控制器决定是带提示重试、直接进入下一轮还是终止。

use crate::core::{RecoveryAction, StepError};
use crate::llm::LlmError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// first_call 为 true 表示这是本次请求的第一次模型调用
    pub fn handle(&self, err: &StepError, first_call: bool) -> RecoveryAction {
        match err {
            StepError::ExtractionFailure(_) => RecoveryAction::RetryWithPrompt(
                "The previous reply contained no usable source code. \
                Reply with the complete program inside a single fenced code block and nothing else."
                    .to_string(),
            ),
            StepError::SyntaxError(msg) => RecoveryAction::RetryWithPrompt(format!(
                "The previous program did not parse: {msg}. Return a syntactically valid program."
            )),
            StepError::IncompleteFunctionUnresolved(names) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "These functions were left as placeholders: {}. Implement every function body fully.",
                    names.join(", ")
                ))
            }
            StepError::ExecutionTimeout(ms) => RecoveryAction::RetryWithPrompt(format!(
                "The program did not finish within {ms}ms. Avoid blocking on input and unbounded loops."
            )),
            StepError::ExecutionError(msg) => RecoveryAction::RetryWithPrompt(format!(
                "The program failed at runtime: {msg}"
            )),
            StepError::BackendError(LlmError::Unreachable(_)) if first_call => RecoveryAction::Abort,
            StepError::BackendError(_) => RecoveryAction::NextIteration,
            StepError::Sandbox(_) => RecoveryAction::NextIteration,
        }
    }
}
