//! 从模型原始回复中提取候选代码
//!
//! 分类器是一组有序的纯函数，第一个给出结果的胜出：
//! JSON 包装 → Markdown 代码块 → 纯思考文本 → 行模式启发式 → 复读 prompt → 未知。
//! 提取前剥离 `<think>` 段，提取后统一还原字面转义序列。

use regex::Regex;
use std::sync::OnceLock;

use crate::generation::types::{Candidate, Classification, ExtractionResult};

/// JSON 中视为代码的字段名
const CODE_FIELDS: [&str; 5] = ["code", "source", "solution", "source_code", "program"];

/// 与代码无关的代码块标签（存在其它代码块时跳过）
const NON_CODE_TAGS: [&str; 6] = ["output", "console", "text", "plaintext", "log", "json"];

/// 叙述性开头
const THINKING_MARKERS: [&str; 14] = [
    "let me think",
    "let me ",
    "let's think",
    "i need to",
    "i will ",
    "i'll ",
    "first, ",
    "thinking:",
    "okay,",
    "hmm",
    "we need to",
    "the user wants",
    "to solve this",
    "i think",
];

/// 文中任意位置出现即视为推理过程
const REASONING_PHRASES: [&str; 4] = ["let me think", "step by step", "my reasoning", "i need to figure out"];

struct ExtractInput<'a> {
    /// 剥离 think 段后的原文（JSON 分类器使用）
    raw: &'a str,
    /// 还原转义后的文本
    text: &'a str,
    prompt: Option<&'a str>,
    default_path: &'a str,
}

type Classifier = fn(&ExtractInput<'_>) -> Option<ExtractionResult>;

const CLASSIFIERS: [Classifier; 6] = [
    classify_json,
    classify_fenced,
    classify_thinking,
    classify_heuristic,
    classify_echo,
    classify_unknown,
];

#[derive(Debug, Clone)]
pub struct ResponseExtractor {
    default_path: String,
}

impl Default for ResponseExtractor {
    fn default() -> Self {
        Self::new("main.py")
    }
}

impl ResponseExtractor {
    /// default_path：没有指明文件名时候选代码的路径
    pub fn new(default_path: impl Into<String>) -> Self {
        Self {
            default_path: default_path.into(),
        }
    }

    pub fn extract(&self, raw: &str, prompt: Option<&str>) -> ExtractionResult {
        let stripped = strip_think_blocks(raw);
        let text = normalize_escapes(&stripped);
        let input = ExtractInput {
            raw: &stripped,
            text: &text,
            prompt,
            default_path: &self.default_path,
        };

        let mut result = CLASSIFIERS
            .iter()
            .find_map(|classify| classify(&input))
            .unwrap_or_else(|| ExtractionResult::failed(Classification::Unknown, "empty response"));

        // 转义只在整段回复上还原一次；提取出的源码（包括 JSON 中已解码的值）原样保留
        if result.candidate.as_ref().is_some_and(Candidate::is_empty) {
            result.candidate = None;
            result.issues.push("extracted candidate is empty".to_string());
        }
        tracing::debug!(
            classified_as = ?result.classified_as,
            raw_len = raw.len(),
            has_candidate = result.has_candidate(),
            "response classified"
        );
        result
    }
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think(?:ing)?>.*?</think(?:ing)?>").expect("valid regex"))
}

/// 去掉 `<think>…</think>`；未闭合的 `<think>` 之后全部丢弃
pub fn strip_think_blocks(text: &str) -> String {
    let out = think_regex().replace_all(text, "");
    match out.find("<think>") {
        Some(pos) => out[..pos].to_string(),
        None => out.into_owned(),
    }
}

/// 文本中没有真实换行、却含未转义的 `\n` 时，把字面转义还原为真实字符
///
/// 还原后必然含真实换行，所以重复调用不再变化。
pub fn normalize_escapes(text: &str) -> String {
    if text.contains('\n') || !has_unescaped_newline(text) {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '\\' || i + 1 >= chars.len() {
            out.push(c);
            i += 1;
            continue;
        }
        let next = chars[i + 1];
        let simple = match next {
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            '"' => Some('"'),
            '\'' => Some('\''),
            '\\' => Some('\\'),
            _ => None,
        };
        if let Some(decoded) = simple {
            out.push(decoded);
            i += 2;
            continue;
        }
        let width = match next {
            'u' => 4,
            'x' => 2,
            _ => 0,
        };
        if width > 0 && i + 2 + width <= chars.len() {
            let hex: String = chars[i + 2..i + 2 + width].iter().collect();
            if let Some(decoded) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                out.push(decoded);
                i += 2 + width;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn has_unescaped_newline(text: &str) -> bool {
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => return true,
                Some(_) | None => {}
            }
        }
    }
    false
}

fn classify_json(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let trimmed = input.raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;

    if let Some(files) = obj.get("files").and_then(|f| f.as_object()) {
        let mut candidate = Candidate::new();
        for (path, source) in files {
            if let Some(source) = source.as_str() {
                candidate.insert(path.clone(), source);
            }
        }
        if !candidate.is_empty() {
            return Some(ExtractionResult::code(Classification::JsonWrapped, candidate));
        }
    }

    for field in CODE_FIELDS {
        if let Some(source) = obj.get(field).and_then(|v| v.as_str()) {
            let fenced = fenced_blocks(source, input.default_path);
            let candidate = if fenced.is_empty() {
                Candidate::single(input.default_path, source)
            } else {
                fenced
            };
            if !candidate.is_empty() {
                return Some(ExtractionResult::code(Classification::JsonWrapped, candidate));
            }
        }
    }

    // 任意字段中包含代码块
    obj.values()
        .filter_map(|v| v.as_str())
        .map(|s| fenced_blocks(s, input.default_path))
        .find(|c| !c.is_empty())
        .map(|c| ExtractionResult::code(Classification::JsonWrapped, c))
}

struct FencedBlock {
    tag: String,
    path: Option<String>,
    body: String,
}

/// info string 中像文件路径的部分：`python main.py`、`main.py`、`src/app.py`
fn path_from_info(info: &str) -> Option<String> {
    info.split_whitespace()
        .map(|t| t.trim_start_matches("file=").trim_matches(|c| c == '"' || c == '\''))
        .find(|t| t.contains('.') || t.contains('/'))
        .filter(|t| !t.starts_with('.') && !t.starts_with('/') && !t.contains(".."))
        .map(str::to_string)
}

fn parse_fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut lines = text.split('\n');
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let fence = if trimmed.starts_with("```") {
            "```"
        } else if trimmed.starts_with("~~~") {
            "~~~"
        } else {
            continue;
        };
        let info = trimmed[fence.len()..].trim();
        let tag = info
            .split_whitespace()
            .next()
            .filter(|t| !t.contains('.') && !t.contains('/'))
            .unwrap_or("")
            .to_lowercase();
        let path = path_from_info(info);

        let mut body: Vec<&str> = Vec::new();
        // 未闭合的代码块取到文本末尾
        for inner in lines.by_ref() {
            if inner.trim() == fence {
                break;
            }
            body.push(inner);
        }
        blocks.push(FencedBlock {
            tag,
            path,
            body: body.join("\n"),
        });
    }
    blocks
}

/// 提取所有代码块组成候选：带路径的块各自成文件，其余按出现顺序拼接到默认文件
fn fenced_blocks(text: &str, default_path: &str) -> Candidate {
    let blocks: Vec<FencedBlock> = parse_fenced_blocks(text)
        .into_iter()
        .filter(|b| !b.body.trim().is_empty())
        .collect();
    let has_code_block = blocks.iter().any(|b| !NON_CODE_TAGS.contains(&b.tag.as_str()));

    let mut candidate = Candidate::new();
    let mut unnamed: Vec<&str> = Vec::new();
    for block in &blocks {
        if has_code_block && NON_CODE_TAGS.contains(&block.tag.as_str()) {
            continue;
        }
        match &block.path {
            Some(path) => {
                let merged = match candidate.get(path) {
                    Some(existing) => format!("{}\n\n{}", existing, block.body),
                    None => block.body.clone(),
                };
                candidate.insert(path.clone(), merged);
            }
            None => unnamed.push(&block.body),
        }
    }
    if !unnamed.is_empty() {
        let joined = unnamed.join("\n\n");
        let merged = match candidate.get(default_path) {
            Some(existing) => format!("{}\n\n{}", joined, existing),
            None => joined,
        };
        candidate.insert(default_path, merged);
    }
    candidate
}

fn classify_fenced(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let candidate = fenced_blocks(input.text, input.default_path);
    (!candidate.is_empty()).then(|| ExtractionResult::code(Classification::Code, candidate))
}

fn code_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:(?:async\s+)?def\s+\w+\s*\(|class\s+\w+\s*[:(]|import\s+[\w.]+|from\s+[\w.]+\s+import\s|@\w+|if\s+__name__\s*==|return\b|print\(|for\s+\w+(?:\s*,\s*\w+)*\s+in\s|while\s.*:\s*$|with\s.*:\s*$|try:\s*$|except\b.*:\s*$|[A-Za-z_][\w.\[\]]*(?:\s*,\s*[A-Za-z_]\w*)*\s*(?:[+\-*/%|&]?=)\s*\S|[A-Za-z_][\w.]*\(.*\)\s*$|#!)"#,
        )
        .expect("valid regex")
    })
}

/// 定义 / 导入类的强信号
fn anchor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?:async\s+)?def\s+\w+\s*\(|class\s+\w+|import\s+\w|from\s+[\w.]+\s+import\s)")
            .expect("valid regex")
    })
}

fn looks_like_code(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty() && code_line_regex().is_match(t)
}

fn looks_like_prose(line: &str) -> bool {
    let t = line.trim();
    if t.is_empty() || looks_like_code(t) {
        return false;
    }
    let words = t.split_whitespace().count();
    let alpha = t.chars().filter(|c| c.is_alphabetic() || c.is_whitespace()).count();
    words >= 3 && alpha * 10 >= t.chars().count() * 8
}

fn classify_thinking(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let text = input.text.trim();
    if text.is_empty() || text.lines().any(looks_like_code) {
        return None;
    }
    let lower = text.to_lowercase();
    let marked = THINKING_MARKERS.iter().any(|m| lower.starts_with(m))
        || REASONING_PHRASES.iter().any(|p| lower.contains(p));
    marked.then(|| {
        ExtractionResult::failed(
            Classification::Thinking,
            "response is reasoning text without any code",
        )
    })
}

/// 从无代码块的文本中拼出候选：从第一行代码开始，收集代码行、缩进行与其间的空行，
/// 遇到顶格的叙述行停止
fn classify_heuristic(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let lines: Vec<&str> = input.text.lines().collect();
    let start = lines.iter().position(|l| looks_like_code(l))?;

    let mut kept: Vec<&str> = Vec::new();
    for line in &lines[start..] {
        let indented = line.starts_with(' ') || line.starts_with('\t');
        if line.trim().is_empty() || indented || looks_like_code(line) || line.trim_start().starts_with('#') {
            kept.push(line);
        } else if looks_like_prose(line) {
            break;
        } else {
            kept.push(line);
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }

    let code_lines = kept.iter().filter(|l| looks_like_code(l)).count();
    let anchored = kept.iter().any(|l| anchor_regex().is_match(l.trim()));
    if !anchored && code_lines < 2 {
        return None;
    }
    let mut candidate = Candidate::new();
    candidate.insert(input.default_path, kept.join("\n"));
    Some(ExtractionResult::code(Classification::Code, candidate))
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn classify_echo(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let prompt = input.prompt?.trim();
    let text = input.text.trim();
    if prompt.is_empty() || text.is_empty() {
        return None;
    }
    let echoed = prompt.contains(text) || text.contains(prompt) || {
        let ours = word_set(text);
        let theirs = word_set(prompt);
        !ours.is_empty() && {
            let shared = ours.intersection(&theirs).count();
            shared * 10 >= ours.len() * 8
        }
    };
    echoed.then(|| {
        ExtractionResult::failed(Classification::PromptEcho, "response repeats the prompt")
    })
}

fn classify_unknown(input: &ExtractInput<'_>) -> Option<ExtractionResult> {
    let issue = if input.text.trim().is_empty() {
        "empty response"
    } else {
        "no code found in response"
    };
    Some(ExtractionResult::failed(Classification::Unknown, issue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(raw: &str) -> ExtractionResult {
        ResponseExtractor::default().extract(raw, None)
    }

    fn main_py(result: &ExtractionResult) -> &str {
        result
            .candidate
            .as_ref()
            .and_then(|c| c.get("main.py"))
            .unwrap_or("")
    }

    #[test]
    fn test_fenced_only_returns_body_verbatim() {
        let code = "def add(a, b):\n    return a + b\n\n\nprint(add(1, 2))";
        let r = extract(&format!("```python\n{}\n```", code));
        assert_eq!(r.classified_as, Classification::Code);
        assert_eq!(main_py(&r), code);
        assert!(r.issues.is_empty());
    }

    #[test]
    fn test_thinking_text_has_no_candidate() {
        let r = extract("Let me think about this problem...");
        assert_eq!(r.classified_as, Classification::Thinking);
        assert!(r.candidate.is_none());
        assert_eq!(r.issues.len(), 1);
    }

    #[test]
    fn test_multiple_blocks_concatenate_in_order() {
        let raw = "First:\n```python\nimport os\n```\nThen:\n```\nprint(os.getcwd())\n```\nOutput:\n```output\n/tmp\n```";
        let r = extract(raw);
        assert_eq!(main_py(&r), "import os\n\nprint(os.getcwd())");
    }

    #[test]
    fn test_path_tagged_fences_become_files() {
        let raw = "```python utils.py\ndef helper():\n    return 1\n```\n```python main.py\nfrom utils import helper\nprint(helper())\n```";
        let r = extract(raw);
        let c = r.candidate.unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("utils.py"), Some("def helper():\n    return 1"));
        assert!(c.get("main.py").unwrap().starts_with("from utils"));
    }

    #[test]
    fn test_unterminated_fence_takes_rest() {
        let r = extract("Here you go:\n```python\nx = 1\nprint(x)\n");
        assert_eq!(main_py(&r), "x = 1\nprint(x)\n");
    }

    #[test]
    fn test_json_wrapped_code_field() {
        let r = extract(r#"{"explanation": "adds", "code": "def add(a, b):\n    return a + b\n"}"#);
        assert_eq!(r.classified_as, Classification::JsonWrapped);
        assert_eq!(main_py(&r), "def add(a, b):\n    return a + b\n");
    }

    #[test]
    fn test_json_files_object() {
        let r = extract(r#"{"files": {"a.py": "x = 1\n", "b.py": "y = 2\n"}}"#);
        assert_eq!(r.classified_as, Classification::JsonWrapped);
        assert_eq!(r.candidate.unwrap().len(), 2);
    }

    #[test]
    fn test_json_field_with_fence() {
        let r = extract(r#"{"answer": "Sure:\n```python\nprint(1)\n```"}"#);
        assert_eq!(r.classified_as, Classification::JsonWrapped);
        assert_eq!(main_py(&r), "print(1)");
    }

    #[test]
    fn test_heuristic_unfenced_code() {
        let raw = "Here is the solution to your task.\nimport math\n\ndef area(r):\n    return math.pi * r ** 2\n\nprint(area(2))\nThis prints the area of a circle of radius two.";
        let r = extract(raw);
        assert_eq!(r.classified_as, Classification::Code);
        assert_eq!(
            main_py(&r),
            "import math\n\ndef area(r):\n    return math.pi * r ** 2\n\nprint(area(2))"
        );
    }

    #[test]
    fn test_prompt_echo() {
        let prompt = "Write a program that prints the first ten prime numbers";
        let r = ResponseExtractor::default().extract(prompt, Some(prompt));
        assert_eq!(r.classified_as, Classification::PromptEcho);
        assert!(r.candidate.is_none());
    }

    #[test]
    fn test_unknown_for_empty_and_noise() {
        assert_eq!(extract("").classified_as, Classification::Unknown);
        assert_eq!(extract("42").classified_as, Classification::Unknown);
    }

    #[test]
    fn test_think_block_is_stripped() {
        let r = extract("<think>Let me plan (carefully)</think>```python\nprint('ok')\n```");
        assert_eq!(main_py(&r), "print('ok')");
    }

    #[test]
    fn test_literal_escapes_are_decoded() {
        let r = extract(r#"```python\ndef f():\n\treturn \"hi\"\n```"#);
        assert_eq!(main_py(&r), "def f():\n\treturn \"hi\"");
    }

    #[test]
    fn test_escaped_newline_inside_string_literal_is_kept() {
        let code = r#"print("Hello\nWorld")"#;
        let r = extract(&format!("```python\n{}\n```", code));
        assert_eq!(main_py(&r), code);
    }

    #[test]
    fn test_json_code_value_is_not_decoded_twice() {
        let r = extract(r#"{"code": "print('a\\nb')"}"#);
        assert_eq!(r.classified_as, Classification::JsonWrapped);
        assert_eq!(main_py(&r), r"print('a\nb')");
    }

    #[test]
    fn test_normalize_escapes_idempotent() {
        let samples = [
            r"a\nb\tc",
            r"keep \\n literal",
            "real\nnewline \\n stays",
            r"é\x41\n",
            "plain",
        ];
        for s in samples {
            let once = normalize_escapes(s);
            assert_eq!(normalize_escapes(&once), once, "sample {:?}", s);
        }
        assert_eq!(normalize_escapes(r"é\x41\n"), "éA\n");
        assert_eq!(normalize_escapes(r"keep \\n literal"), r"keep \\n literal");
    }
}
