//! 桩函数检测、补全与合并
//!
//! 函数体在去掉 docstring 与注释后为空、只有 `pass` / `...`、或以 `raise NotImplementedError` 开头即视为桩。
//! `@abstractmethod` / `@overload` 修饰的函数不算。补全回复按限定名（`Class.method`）匹配，
//! 找不到时按唯一的裸函数名匹配；只替换函数体，其余代码逐字保留。

use crate::generation::backend::ModelBackend;
use crate::generation::extractor::ResponseExtractor;
use crate::generation::lexer::{self, Scan};
use crate::generation::prompt::PromptComposer;
use crate::generation::types::{Candidate, IncompleteFunction, StubReason};
use crate::llm::LlmError;

const EXCLUDED_DECORATORS: [&str; 2] = ["abstractmethod", "overload"];

/// 解析出的函数定义（行下标从 0 开始）
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub qualified: String,
    pub def_line: usize,
    pub header_end: usize,
    /// 块头冒号在 header_end 行中的字符下标
    pub colon_col: usize,
    pub indent: usize,
    pub decorators: Vec<String>,
    /// 与 def 同行的函数体
    pub inline_body: Option<String>,
    pub body_start: usize,
    /// 不含
    pub body_end: usize,
}

fn is_docstring(code: &str) -> bool {
    let t = code.trim().trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    (t.starts_with('"') || t.starts_with('\''))
        && t.chars().all(|c| c == '"' || c == '\'' || c.is_whitespace())
}

fn def_name(code: &str) -> Option<&str> {
    let rest = code.strip_prefix("async").map(str::trim_start).unwrap_or(code);
    let rest = rest.strip_prefix("def")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let end = rest.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
    (end > 0).then(|| &rest[..end])
}

fn class_name(code: &str) -> Option<&str> {
    let rest = code.strip_prefix("class")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

/// 块头中深度为 0 的冒号：(行下标, 字符下标)
fn header_colon(scan: &Scan, first: usize, last: usize) -> Option<(usize, usize)> {
    let mut depth: i32 = 0;
    for idx in first..=last {
        let chars: Vec<char> = scan.lines[idx].masked.chars().collect();
        for (col, c) in chars.iter().enumerate() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                ':' if depth <= 0 && chars.get(col + 1) != Some(&'=') => return Some((idx, col)),
                _ => {}
            }
        }
    }
    None
}

/// 解析源码中的所有函数定义（含嵌套与类方法）
pub fn parse_functions(source: &str) -> Vec<FunctionDef> {
    let scan = lexer::scan(source);
    let logical = scan.logical_lines();
    let mut scopes: Vec<(usize, String)> = Vec::new();
    let mut defs = Vec::new();

    for (i, line) in logical.iter().enumerate() {
        while scopes.last().is_some_and(|(indent, _)| *indent >= line.indent) {
            scopes.pop();
        }
        let qualify = |name: &str| {
            let mut parts: Vec<&str> = scopes.iter().map(|(_, n)| n.as_str()).collect();
            parts.push(name);
            parts.join(".")
        };

        if let Some(name) = class_name(&line.code) {
            scopes.push((line.indent, name.to_string()));
            continue;
        }
        let Some(name) = def_name(&line.code) else {
            continue;
        };
        let Some((colon_line, colon_col)) = header_colon(&scan, line.first, line.last) else {
            continue;
        };

        let decorators: Vec<String> = logical[..i]
            .iter()
            .rev()
            .take_while(|l| l.indent == line.indent && l.code.starts_with('@'))
            .map(|l| l.code.clone())
            .collect();

        let inline: String = scan.lines[colon_line]
            .masked
            .chars()
            .skip(colon_col + 1)
            .collect();
        let inline_body = if inline.trim().is_empty() {
            None
        } else {
            Some(
                scan.lines[colon_line]
                    .text
                    .chars()
                    .skip(colon_col + 1)
                    .collect::<String>()
                    .trim()
                    .to_string(),
            )
        };

        let body_start = line.last + 1;
        let body_end = if inline_body.is_some() {
            body_start
        } else {
            logical[i + 1..]
                .iter()
                .take_while(|l| l.indent > line.indent)
                .last()
                .map(|l| l.last + 1)
                .unwrap_or(body_start)
        };

        defs.push(FunctionDef {
            name: name.to_string(),
            qualified: qualify(name),
            def_line: line.first,
            header_end: line.last,
            colon_col,
            indent: line.indent,
            decorators,
            inline_body,
            body_start,
            body_end,
        });
        scopes.push((line.indent, name.to_string()));
    }
    defs
}

/// 函数体的语句（masked，按分号拆分）
fn body_statements(scan: &Scan, def: &FunctionDef) -> Vec<String> {
    let raw: Vec<String> = match &def.inline_body {
        Some(_) => {
            let masked: String = scan.lines[def.header_end]
                .masked
                .chars()
                .skip(def.colon_col + 1)
                .collect();
            vec![masked]
        }
        None => scan
            .logical_lines()
            .into_iter()
            .filter(|l| l.first >= def.body_start && l.last < def.body_end)
            .map(|l| l.code)
            .collect(),
    };
    raw.iter()
        .flat_map(|code| code.split(';').map(|s| s.trim().to_string()).collect::<Vec<_>>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn stub_reason(statements: &[String]) -> Option<StubReason> {
    let body: Vec<&str> = match statements.first() {
        Some(first) if is_docstring(first) => statements[1..].iter().map(String::as_str).collect(),
        _ => statements.iter().map(String::as_str).collect(),
    };
    let Some(first) = body.first() else {
        return Some(StubReason::EmptyBody);
    };
    if first.starts_with("raise NotImplementedError") {
        return Some(StubReason::NotImplemented);
    }
    if body.iter().all(|s| *s == "pass" || *s == "...") {
        return Some(if body.iter().any(|s| *s == "pass") {
            StubReason::PassOnly
        } else {
            StubReason::EllipsisOnly
        });
    }
    None
}

fn is_excluded(def: &FunctionDef) -> bool {
    def.decorators
        .iter()
        .any(|d| EXCLUDED_DECORATORS.iter().any(|x| d.contains(x)))
}

/// 检测单个文件中的桩函数
pub fn detect_in_source(path: &str, source: &str) -> Vec<IncompleteFunction> {
    let scan = lexer::scan(source);
    parse_functions(source)
        .into_iter()
        .filter(|def| !is_excluded(def))
        .filter_map(|def| {
            stub_reason(&body_statements(&scan, &def)).map(|reason| IncompleteFunction {
                name: def.qualified.clone(),
                file: path.to_string(),
                line: def.def_line + 1,
                reason,
            })
        })
        .collect()
}

/// 检测候选中所有 Python 文件的桩函数
pub fn detect(candidate: &Candidate) -> Vec<IncompleteFunction> {
    candidate
        .files()
        .filter(|(path, _)| crate::generation::analyzer::HeuristicAnalyzer::is_python(path))
        .flat_map(|(path, source)| detect_in_source(path, source))
        .collect()
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

fn reindent(lines: &[String], target: usize) -> Vec<String> {
    let base = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| leading_spaces(l))
        .min()
        .unwrap_or(0);
    let pad = " ".repeat(target);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                let strip = leading_spaces(l).min(base);
                format!("{}{}", pad, l.chars().skip(strip).collect::<String>())
            }
        })
        .collect()
}

/// 函数体的原文行；内联函数体视为一行
fn body_lines(source_lines: &[String], def: &FunctionDef) -> Vec<String> {
    match &def.inline_body {
        Some(inline) => vec![inline.clone()],
        None => source_lines[def.body_start..def.body_end].to_vec(),
    }
}

/// docstring 对应的原文行（只看块状函数体的第一条语句）
fn docstring_lines(scan: &Scan, source_lines: &[String], def: &FunctionDef) -> Option<Vec<String>> {
    if def.inline_body.is_some() {
        return None;
    }
    let first = scan
        .logical_lines()
        .into_iter()
        .find(|l| l.first >= def.body_start && l.last < def.body_end)?;
    is_docstring(&first.code).then(|| source_lines[first.first..=first.last].to_vec())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub candidate: Candidate,
    /// 已替换的限定名
    pub merged: Vec<String>,
}

struct Completion {
    def: FunctionDef,
    lines: Vec<String>,
    has_docstring: bool,
}

fn collect_completions(completion: &Candidate) -> Vec<Completion> {
    let mut out = Vec::new();
    for (_, source) in completion.files() {
        let scan = lexer::scan(source);
        let lines: Vec<String> = source.split('\n').map(str::to_string).collect();
        for def in parse_functions(source) {
            if stub_reason(&body_statements(&scan, &def)).is_some() {
                continue;
            }
            let has_docstring = docstring_lines(&scan, &lines, &def).is_some();
            out.push(Completion {
                lines: body_lines(&lines, &def),
                def,
                has_docstring,
            });
        }
    }
    out
}

fn find_completion<'a>(completions: &'a [Completion], stub: &IncompleteFunction) -> Option<&'a Completion> {
    if let Some(c) = completions.iter().find(|c| c.def.qualified == stub.name) {
        return Some(c);
    }
    let bare = stub.name.rsplit('.').next().unwrap_or(&stub.name);
    let mut matches = completions.iter().filter(|c| c.def.name == bare);
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// 把补全回复中的函数体合并回原候选
pub fn merge_completions(
    original: &Candidate,
    stubs: &[IncompleteFunction],
    completion: &Candidate,
) -> MergeResult {
    let completions = collect_completions(completion);
    let mut merged = Vec::new();
    let mut result = original.clone();

    for (path, source) in original.files() {
        let file_stubs: Vec<&IncompleteFunction> = stubs.iter().filter(|s| s.file == path).collect();
        if file_stubs.is_empty() {
            continue;
        }
        let scan = lexer::scan(source);
        let mut lines: Vec<String> = source.split('\n').map(str::to_string).collect();
        let mut defs: Vec<FunctionDef> = parse_functions(source)
            .into_iter()
            .filter(|d| file_stubs.iter().any(|s| s.name == d.qualified && s.line == d.def_line + 1))
            .collect();
        // 从后往前替换，前面的行号保持有效
        defs.sort_by(|a, b| b.def_line.cmp(&a.def_line));

        let mut changed = false;
        for def in defs {
            let Some(stub) = file_stubs.iter().find(|s| s.name == def.qualified) else {
                continue;
            };
            let Some(found) = find_completion(&completions, stub) else {
                continue;
            };

            let target = match &def.inline_body {
                None if def.body_end > def.body_start => source
                    .split('\n')
                    .skip(def.body_start)
                    .find(|l| !l.trim().is_empty())
                    .map(leading_spaces)
                    .unwrap_or(def.indent + 4),
                _ => def.indent + 4,
            };
            let mut body = Vec::new();
            if !found.has_docstring {
                if let Some(doc) = docstring_lines(&scan, &lines, &def) {
                    body.extend(reindent(&doc, target));
                }
            }
            body.extend(reindent(&found.lines, target));

            if def.inline_body.is_some() {
                let header: String = lines[def.header_end].chars().take(def.colon_col + 1).collect();
                lines[def.header_end] = header;
                lines.splice(def.header_end + 1..def.header_end + 1, body);
            } else {
                lines.splice(def.body_start..def.body_end, body);
            }
            merged.push(def.qualified.clone());
            changed = true;
        }
        if changed {
            result.insert(path, lines.join("\n"));
        }
    }

    merged.reverse();
    MergeResult {
        candidate: result,
        merged,
    }
}

/// 一次补全的结果；由控制器写入历史
#[derive(Debug, Clone)]
pub struct Resolution {
    pub prompt: String,
    pub raw_response: Option<String>,
    pub candidate: Candidate,
    pub merged: Vec<String>,
    pub still_incomplete: Vec<IncompleteFunction>,
    pub error: Option<LlmError>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.still_incomplete.is_empty()
    }
}

/// 每轮最多一次补全请求，不无限重试
#[derive(Debug, Clone)]
pub struct IncompleteFunctionResolver {
    extractor: ResponseExtractor,
}

impl IncompleteFunctionResolver {
    pub fn new(extractor: ResponseExtractor) -> Self {
        Self { extractor }
    }

    pub async fn resolve(
        &self,
        backend: &ModelBackend,
        composer: &PromptComposer,
        request: &str,
        candidate: &Candidate,
        stubs: &[IncompleteFunction],
    ) -> Resolution {
        let prompt = composer.completion(request, candidate, stubs);
        let raw = match backend.generate(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "completion request failed");
                return Resolution {
                    prompt,
                    raw_response: None,
                    candidate: candidate.clone(),
                    merged: Vec::new(),
                    still_incomplete: stubs.to_vec(),
                    error: Some(e),
                };
            }
        };

        let extraction = self.extractor.extract(&raw, Some(prompt.as_str()));
        let merge = match extraction.candidate {
            Some(ref completion) => merge_completions(candidate, stubs, completion),
            None => MergeResult {
                candidate: candidate.clone(),
                merged: Vec::new(),
            },
        };
        let still_incomplete = detect(&merge.candidate);
        tracing::info!(
            stubs = stubs.len(),
            merged = merge.merged.len(),
            remaining = still_incomplete.len(),
            "incomplete functions resolved"
        );
        Resolution {
            prompt,
            raw_response: Some(raw),
            candidate: merge.candidate,
            merged: merge.merged,
            still_incomplete,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(found: &[IncompleteFunction]) -> Vec<&str> {
        found.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_detects_each_stub_kind() {
        let src = r#"class Stack:
    def push(self, item):
        """Push an item."""
        pass

    def pop(self):
        raise NotImplementedError("todo")

    def peek(self): ...

    def size(self):
        # later
        """Docstring after comment."""

    def ok(self):
        return 1


def helper():
    pass
"#;
        let found = detect_in_source("main.py", src);
        assert_eq!(
            names(&found),
            vec!["Stack.push", "Stack.pop", "Stack.peek", "Stack.size", "helper"]
        );
        assert_eq!(found[0].reason, StubReason::PassOnly);
        assert_eq!(found[1].reason, StubReason::NotImplemented);
        assert_eq!(found[2].reason, StubReason::EllipsisOnly);
        assert_eq!(found[3].reason, StubReason::EmptyBody);
        assert_eq!(found[4].line, 19);
    }

    #[test]
    fn test_abstract_and_overload_are_excluded() {
        let src = "from abc import ABC, abstractmethod\n\nclass Shape(ABC):\n    @abstractmethod\n    def area(self):\n        ...\n\n    @typing.overload\n    def f(self, x: int) -> int: ...\n";
        assert!(detect_in_source("main.py", src).is_empty());
    }

    #[test]
    fn test_real_body_with_pass_is_not_stub() {
        let src = "def f(x):\n    if x:\n        pass\n    return x\n";
        assert!(detect_in_source("main.py", src).is_empty());
    }

    #[test]
    fn test_merge_replaces_only_stub_body() {
        let original = Candidate::single(
            "main.py",
            "import math\n\n\ndef area(r):\n    \"\"\"Circle area.\"\"\"\n    pass\n\n\nprint(area(2))\n",
        );
        let stubs = detect(&original);
        let completion = Candidate::single("main.py", "def area(r):\n    return math.pi * r * r\n");
        let merged = merge_completions(&original, &stubs, &completion);
        assert_eq!(merged.merged, vec!["area".to_string()]);
        assert_eq!(
            merged.candidate.get("main.py").unwrap(),
            "import math\n\n\ndef area(r):\n    \"\"\"Circle area.\"\"\"\n    return math.pi * r * r\n\n\nprint(area(2))\n"
        );
        assert!(detect(&merged.candidate).is_empty());
    }

    #[test]
    fn test_merge_method_by_bare_name_and_inline_stub() {
        let original = Candidate::single(
            "main.py",
            "class Counter:\n    def __init__(self):\n        self.n = 0\n\n    def bump(self): ...\n",
        );
        let stubs = detect(&original);
        assert_eq!(names(&stubs), vec!["Counter.bump"]);
        let completion = Candidate::single("main.py", "def bump(self):\n    self.n += 1\n    return self.n");
        let merged = merge_completions(&original, &stubs, &completion);
        assert_eq!(
            merged.candidate.get("main.py").unwrap(),
            "class Counter:\n    def __init__(self):\n        self.n = 0\n\n    def bump(self):\n        self.n += 1\n        return self.n\n"
        );
    }

    #[test]
    fn test_stub_completion_is_not_merged() {
        let original = Candidate::single("main.py", "def f():\n    pass\n");
        let stubs = detect(&original);
        let completion = Candidate::single("main.py", "def f():\n    ...\n");
        let merged = merge_completions(&original, &stubs, &completion);
        assert!(merged.merged.is_empty());
        assert_eq!(merged.candidate, original);
    }
}
