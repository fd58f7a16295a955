//! Prompt 构造
//!
//! 首轮给出直接任务；之后的轮次附带上一轮最佳候选、按严重度排序的违规和最近一次错误提示。
//! 另外负责桩函数补全与自动修复两类专用 prompt。所有方法都不会失败。

use crate::generation::context::ContextItem;
use crate::generation::types::{Candidate, ErrorDetail, IncompleteFunction, ScoredCandidate, Violation};

/// 自动修复 prompt 中最多列出的历史错误数
pub const MAX_PREVIOUS_ERRORS: usize = 3;

const INITIAL_TEMPLATE: &str = r#"You are an expert Python developer. Write a complete, runnable program for the task below.

## Task
{request}
{context}
## Requirements
- Return the full program in a single ```python code block.
- Implement every function completely. Do not leave `pass`, `...` or `raise NotImplementedError` placeholders.
- The program must run with `python3 main.py` and exit with status 0.
- Do not explain the code outside the code block."#;

const IMPROVEMENT_TEMPLATE: &str = r#"You are an expert Python developer. Improve the previous attempt at the task below.

## Task
{request}
{context}
## Previous attempt (score {score}/100)
```python
{code}
```

## Fix these problems
{violations}
{hint}
Return the complete corrected program in a single ```python code block. Keep everything that already works."#;

const COMPLETION_TEMPLATE: &str = r#"The following Python program contains placeholder functions that were never implemented.

## Task
{request}

## Program
```python
{code}
```

## Functions to implement
{stubs}

Return ONLY the completed definitions of the functions listed above, each with its original signature, inside a single ```python code block. Do not repeat the rest of the program."#;

const FIX_TEMPLATE: &str = r#"The Python program below fails when executed. Fix it.

## Task
{request}

## Program
```python
{code}
```

## Error
{error}
{previous}
Return the complete fixed program in a single ```python code block."#;

#[derive(Debug, Clone)]
pub struct PromptComposer {
    max_violations: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self { max_violations: 5 }
    }
}

impl PromptComposer {
    pub fn new(max_violations: usize) -> Self {
        Self { max_violations }
    }

    /// 根据迭代序号与是否有上一轮候选选择 prompt
    pub fn compose(
        &self,
        iteration: usize,
        request: &str,
        context: &[ContextItem],
        previous: Option<&ScoredCandidate>,
        last_error: Option<&str>,
    ) -> String {
        match previous {
            Some(prev) if iteration > 0 => self.improvement(request, context, prev, last_error),
            _ => {
                let mut prompt = self.initial(request, context);
                if iteration > 0 {
                    if let Some(hint) = last_error.filter(|h| !h.trim().is_empty()) {
                        prompt.push_str("\n\n## Note\n");
                        prompt.push_str(hint.trim());
                    }
                }
                prompt
            }
        }
    }

    pub fn initial(&self, request: &str, context: &[ContextItem]) -> String {
        fill(
            INITIAL_TEMPLATE,
            &[("request", request.trim()), ("context", render_context(context).as_str())],
        )
    }

    pub fn improvement(
        &self,
        request: &str,
        context: &[ContextItem],
        previous: &ScoredCandidate,
        last_error: Option<&str>,
    ) -> String {
        let violations = self.top_violations(&previous.violations);
        let mut listed: Vec<String> = violations.iter().map(|v| format!("- {}", v)).collect();
        for stub in &previous.incomplete {
            listed.push(format!("- implement `{}` ({})", stub.name, stub.reason));
        }
        let violations = if listed.is_empty() {
            "- No static problems were found; make the program more robust and complete.".to_string()
        } else {
            listed.join("\n")
        };
        let hint = match last_error.filter(|h| !h.trim().is_empty()) {
            Some(h) => format!("\n## Last error\n{}\n", h.trim()),
            None => String::new(),
        };
        fill(
            IMPROVEMENT_TEMPLATE,
            &[
                ("request", request.trim()),
                ("context", render_context(context).as_str()),
                ("score", format!("{:.1}", previous.score).as_str()),
                ("code", previous.candidate.render().trim_end()),
                ("violations", violations.as_str()),
                ("hint", hint.as_str()),
            ],
        )
    }

    /// 桩函数补全 prompt，逐个列出限定名、位置与原因
    pub fn completion(&self, request: &str, candidate: &Candidate, stubs: &[IncompleteFunction]) -> String {
        let stubs = stubs
            .iter()
            .map(|s| format!("- `{}` at {}:{} ({})", s.name, s.file, s.line, s.reason))
            .collect::<Vec<_>>()
            .join("\n");
        fill(
            COMPLETION_TEMPLATE,
            &[
                ("request", request.trim()),
                ("code", candidate.render().trim_end()),
                ("stubs", stubs.as_str()),
            ],
        )
    }

    /// 自动修复 prompt；previous_errors 只取最近的 3 条
    pub fn fix(
        &self,
        request: &str,
        candidate: &Candidate,
        error: &str,
        previous_errors: &[String],
    ) -> String {
        let recent: Vec<&String> = previous_errors
            .iter()
            .rev()
            .take(MAX_PREVIOUS_ERRORS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let previous = if recent.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = recent.iter().map(|e| format!("- {}", e)).collect();
            format!(
                "\n## Earlier fix attempts also failed with\n{}\n",
                lines.join("\n")
            )
        };
        fill(
            FIX_TEMPLATE,
            &[
                ("request", request.trim()),
                ("code", candidate.render().trim_end()),
                ("error", error.trim()),
                ("previous", previous.as_str()),
            ],
        )
    }

    /// 严重度从高到低，同级保持原顺序
    fn top_violations<'a>(&self, violations: &'a [Violation]) -> Vec<&'a Violation> {
        let mut sorted: Vec<&Violation> = violations.iter().collect();
        sorted.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));
        sorted.truncate(self.max_violations);
        sorted
    }
}

/// 给修复 prompt 用的错误文本
pub fn describe_error(detail: &ErrorDetail, stderr: &str) -> String {
    let tail: Vec<&str> = stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev().collect();
    if tail.is_empty() {
        detail.to_string()
    } else {
        format!("{}\n\nstderr (tail):\n{}", detail, tail.join("\n"))
    }
}

/// 单遍替换 `{name}` 占位符，替换进来的文本不再被解析
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let value = after.find('}').and_then(|end| {
            let key = &after[..end];
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, end))
        });
        match value {
            Some((v, end)) => {
                out.push_str(v);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_context(context: &[ContextItem]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Project context\n");
    for item in context {
        out.push_str(&format!("### {}\n{}\n", item.name, item.text.trim()));
    }
    out
}
