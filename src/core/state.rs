//! 会话状态与历史
//!
//! SessionState 是整个请求唯一的可变游标，只由迭代控制器通过 SessionDelta 提交修改；
//! GenerationStep 是只追加的审计记录；SessionSnapshot 是对外稳定的可序列化结构，用于检查点与恢复。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::generation::types::{
    Candidate, ExecutionOutcome, ScoredCandidate, ValidationSummary, Verdict,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub request: String,
    pub current_files: Candidate,
    pub current_iteration: usize,
    pub current_fix_attempt: u32,
    pub last_error: Option<String>,
    pub is_complete: bool,
}

impl SessionState {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            current_files: Candidate::new(),
            current_iteration: 0,
            current_fix_attempt: 0,
            last_error: None,
            is_complete: false,
        }
    }

    /// 提交一次状态变更
    pub fn apply(&mut self, delta: SessionDelta) {
        match delta {
            SessionDelta::IterationStarted(i) => {
                self.current_iteration = i;
                self.current_fix_attempt = 0;
            }
            SessionDelta::IterationFinished => self.current_iteration += 1,
            SessionDelta::FilesReplaced(files) => self.current_files = files,
            SessionDelta::FixAttempt(n) => self.current_fix_attempt = n,
            SessionDelta::ErrorRecorded(err) => self.last_error = err,
            SessionDelta::Completed => self.is_complete = true,
        }
    }
}

/// 各阶段返回给控制器的状态变更
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDelta {
    IterationStarted(usize),
    /// current_iteration 指向下一轮
    IterationFinished,
    FilesReplaced(Candidate),
    FixAttempt(u32),
    ErrorRecorded(Option<String>),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Generation,
    BackendError,
    Resolution,
    Execution,
    AutoFix,
}

/// 执行校验记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub verdict: Verdict,
    pub outcome: Option<ExecutionOutcome>,
}

/// 历史中的一步，写入后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub step_type: StepType,
    pub iteration: usize,
    /// AutoFix 的尝试序号（从 1 开始）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_snapshot: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl GenerationStep {
    pub fn new(step_type: StepType, iteration: usize) -> Self {
        Self {
            step_type,
            iteration,
            attempt: None,
            prompt: None,
            raw_response: None,
            candidate_snapshot: None,
            validation: None,
            execution: None,
            feedback: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    pub fn with_candidate(mut self, candidate: Candidate) -> Self {
        self.candidate_snapshot = Some(candidate);
        self
    }

    pub fn with_validation(mut self, validation: ValidationSummary) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_execution(mut self, verdict: Verdict, outcome: Option<ExecutionOutcome>) -> Self {
        self.execution = Some(ExecutionRecord { verdict, outcome });
        self
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// 当前最佳候选及其校验标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCandidate {
    pub scored: ScoredCandidate,
    /// None 表示未执行校验
    pub execution_successful: Option<bool>,
    /// 自动修复是否让执行通过
    pub execution_fixed: bool,
    pub fix_attempts: u32,
}

impl BestCandidate {
    pub fn new(scored: ScoredCandidate) -> Self {
        Self {
            scored,
            execution_successful: None,
            execution_fixed: false,
            fix_attempts: 0,
        }
    }

    pub fn score(&self) -> f64 {
        self.scored.score
    }
}

/// 对外稳定的可序列化会话结构（字段名是调用方可依赖的契约）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub history: Vec<GenerationStep>,
    pub best: Option<BestCandidate>,
}
