use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 候选：相对路径 → 源码文本
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate {
    files: BTreeMap<String, String>,
}

impl Candidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(path: impl Into<String>, source: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.insert(path, source);
        c
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, s)| (p.as_str(), s.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// 没有文件，或所有文件都只有空白
    pub fn is_empty(&self) -> bool {
        self.files.values().all(|s| s.trim().is_empty())
    }

    /// 入口文件：优先 preferred，否则取第一个文件
    pub fn entry<'a>(&'a self, preferred: &'a str) -> Option<&'a str> {
        if self.files.contains_key(preferred) {
            return Some(preferred);
        }
        self.files.keys().next().map(String::as_str)
    }

    /// 对每个文件应用变换
    pub fn map_sources(&self, mut f: impl FnMut(&str, &str) -> String) -> Self {
        Self {
            files: self
                .files
                .iter()
                .map(|(p, s)| (p.clone(), f(p, s)))
                .collect(),
        }
    }

    /// 供 prompt 使用的文本形式：单文件直接给出代码，多文件每段带路径
    pub fn render(&self) -> String {
        if self.files.len() == 1 {
            if let Some(source) = self.files.values().next() {
                return source.clone();
            }
        }
        self.files
            .iter()
            .map(|(p, s)| format!("# file: {}\n{}", p, s))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// 计分权重
    pub fn weight(self) -> f64 {
        match self {
            Severity::Error => 15.0,
            Severity::Warning => 5.0,
            Severity::Info => 1.0,
        }
    }

    /// 越大越严重
    pub fn rank(self) -> u8 {
        match self {
            Severity::Error => 2,
            Severity::Warning => 1,
            Severity::Info => 0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// 静态分析给出的单条违规
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub message: String,
    pub file: String,
    pub line: Option<usize>,
    pub severity: Severity,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "[{}] {}:{}: {} ({})",
                self.severity, self.file, line, self.message, self.kind
            ),
            None => write!(f, "[{}] {}: {} ({})", self.severity, self.file, self.message, self.kind),
        }
    }
}

/// 模型原始回复的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Code,
    Thinking,
    PromptEcho,
    JsonWrapped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub classified_as: Classification,
    pub candidate: Option<Candidate>,
    pub issues: Vec<String>,
}

impl ExtractionResult {
    pub fn code(classified_as: Classification, candidate: Candidate) -> Self {
        Self {
            classified_as,
            candidate: Some(candidate),
            issues: Vec::new(),
        }
    }

    pub fn failed(classified_as: Classification, issue: impl Into<String>) -> Self {
        Self {
            classified_as,
            candidate: None,
            issues: vec![issue.into()],
        }
    }

    pub fn has_candidate(&self) -> bool {
        self.candidate.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// 桩函数的判定原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubReason {
    /// 只有 docstring / 注释
    EmptyBody,
    PassOnly,
    EllipsisOnly,
    NotImplemented,
}

impl fmt::Display for StubReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubReason::EmptyBody => write!(f, "body has no statements"),
            StubReason::PassOnly => write!(f, "body is only `pass`"),
            StubReason::EllipsisOnly => write!(f, "body is only `...`"),
            StubReason::NotImplemented => write!(f, "body raises NotImplementedError"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteFunction {
    /// 限定名，类方法为 `Class.method`
    pub name: String,
    pub file: String,
    pub line: usize,
    pub reason: StubReason,
}

impl fmt::Display for IncompleteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}, {})", self.name, self.file, self.line, self.reason)
    }
}

/// 语法检查 / 修复的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntaxStatus {
    Valid,
    Repaired,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
    pub explanation: String,
    pub violations: Vec<Violation>,
    pub iteration_index: usize,
    /// 打分时检测到的桩函数
    #[serde(default)]
    pub incomplete: Vec<IncompleteFunction>,
}

/// 从 stderr 解析出的错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " (at {}:{})", file, line),
            (Some(file), None) => write!(f, " (in {})", file),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// 一次执行校验的判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    TimedOut { timeout_ms: u64 },
    Failed { error: ErrorDetail },
    /// 沙箱本身出错，与候选代码无关
    SandboxFailure { message: String },
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    /// 是否值得交给自动修复
    pub fn is_fixable(&self) -> bool {
        matches!(self, Verdict::TimedOut { .. } | Verdict::Failed { .. })
    }
}

/// 写入历史的校验摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub classified_as: Classification,
    pub syntax: Option<SyntaxStatus>,
    pub score: f64,
    pub explanation: String,
    pub violations: Vec<Violation>,
    pub incomplete: Vec<IncompleteFunction>,
    pub issues: Vec<String>,
}

/// 终止状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// 分数达到阈值
    Converged,
    /// 迭代预算耗尽
    Exhausted,
}
