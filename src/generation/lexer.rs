//! Python 源码的行级扫描
//!
//! 不做完整词法分析，只跟踪字符串、注释与括号，输出与原文逐字符对齐的 masked 行：
//! 字符串内容与注释替换为空格，引号与代码字符保持原样。语法检查、修复、静态分析和桩函数检测都基于它。

const OPENERS: [char; 3] = ['(', '[', '{'];
const CLOSERS: [char; 3] = [')', ']', '}'];

pub fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn opener_for(close: char) -> char {
    match close {
        ')' => '(',
        ']' => '[',
        _ => '{',
    }
}

/// 扫描后的物理行
#[derive(Debug, Clone)]
pub struct ScannedLine {
    /// 从 1 开始
    pub number: usize,
    pub text: String,
    /// 与 text 逐字符对齐
    pub masked: String,
    /// 处于括号、三引号字符串或反斜杠续行之中
    pub continuation: bool,
    /// 注释 `#` 的字符下标
    pub comment_col: Option<usize>,
}

impl ScannedLine {
    pub fn indent(&self) -> usize {
        indent_width(&self.text)
    }

    pub fn is_blank(&self) -> bool {
        self.masked.trim().is_empty()
    }

    pub fn comment(&self) -> Option<String> {
        self.comment_col
            .map(|col| self.text.chars().skip(col).collect())
    }
}

/// 缩进宽度，tab 对齐到 8 列
pub fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenBracket {
    pub ch: char,
    /// 行下标（从 0 开始）
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketError {
    /// 右括号与栈顶不匹配
    Mismatch { open: OpenBracket, close: char, line: usize, col: usize },
    /// 栈为空时出现右括号
    UnexpectedClose { close: char, line: usize, col: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnterminatedString {
    /// 行下标（从 0 开始）
    pub line: usize,
    pub col: usize,
    pub quote: char,
    pub triple: bool,
}

#[derive(Debug, Clone)]
pub struct Scan {
    pub lines: Vec<ScannedLine>,
    pub bracket_errors: Vec<BracketError>,
    /// 文件末尾仍未闭合的括号（栈底在前）
    pub unclosed: Vec<OpenBracket>,
    pub unterminated: Vec<UnterminatedString>,
}

/// 逻辑行：一个语句起始的物理行加上它的续行
#[derive(Debug, Clone)]
pub struct LogicalLine {
    pub first: usize,
    pub last: usize,
    pub indent: usize,
    /// 各物理行 masked 内容以空格拼接并去掉首尾空白
    pub code: String,
}

impl LogicalLine {
    /// 1-based 行号
    pub fn number(&self) -> usize {
        self.first + 1
    }

    /// 语句的第一个标识符
    pub fn first_word(&self) -> &str {
        let end = self
            .code
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(self.code.len());
        &self.code[..end]
    }
}

#[derive(Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
    line: usize,
    col: usize,
}

pub fn scan(source: &str) -> Scan {
    let mut lines = Vec::new();
    let mut bracket_errors = Vec::new();
    let mut unterminated = Vec::new();
    let mut stack: Vec<OpenBracket> = Vec::new();
    let mut open_string: Option<OpenString> = None;
    let mut backslash_continues = false;

    for (idx, text) in source.split('\n').enumerate() {
        let continuation = open_string.is_some() || !stack.is_empty() || backslash_continues;
        let chars: Vec<char> = text.chars().collect();
        let mut masked: Vec<char> = Vec::with_capacity(chars.len());
        let mut escape_at_eol = false;
        let mut comment_col = None;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if let Some(s) = open_string {
                if c == '\\' {
                    masked.push(' ');
                    if i + 1 < chars.len() {
                        masked.push(' ');
                        i += 2;
                    } else {
                        escape_at_eol = true;
                        i += 1;
                    }
                    continue;
                }
                if c == s.quote {
                    if !s.triple {
                        masked.push(c);
                        open_string = None;
                        i += 1;
                        continue;
                    }
                    if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                        masked.extend([c, c, c]);
                        open_string = None;
                        i += 3;
                        continue;
                    }
                }
                masked.push(' ');
                i += 1;
                continue;
            }

            if c == '#' {
                comment_col = Some(i);
                masked.extend(std::iter::repeat(' ').take(chars.len() - i));
                break;
            }
            if c == '"' || c == '\'' {
                let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                open_string = Some(OpenString {
                    quote: c,
                    triple,
                    line: idx,
                    col: i,
                });
                if triple {
                    masked.extend([c, c, c]);
                    i += 3;
                } else {
                    masked.push(c);
                    i += 1;
                }
                continue;
            }
            if OPENERS.contains(&c) {
                stack.push(OpenBracket { ch: c, line: idx, col: i });
            } else if CLOSERS.contains(&c) {
                match stack.pop() {
                    None => bracket_errors.push(BracketError::UnexpectedClose {
                        close: c,
                        line: idx,
                        col: i,
                    }),
                    Some(open) if open.ch == opener_for(c) => {}
                    Some(open) => bracket_errors.push(BracketError::Mismatch {
                        open,
                        close: c,
                        line: idx,
                        col: i,
                    }),
                }
            }
            masked.push(c);
            i += 1;
        }

        if let Some(s) = open_string {
            if !s.triple && !escape_at_eol {
                unterminated.push(UnterminatedString {
                    line: s.line,
                    col: s.col,
                    quote: s.quote,
                    triple: false,
                });
                open_string = None;
            }
        }

        let masked: String = masked.into_iter().collect();
        backslash_continues = open_string.is_none() && masked.trim_end().ends_with('\\');
        lines.push(ScannedLine {
            number: idx + 1,
            text: text.to_string(),
            masked,
            continuation,
            comment_col,
        });
    }

    if let Some(s) = open_string {
        unterminated.push(UnterminatedString {
            line: s.line,
            col: s.col,
            quote: s.quote,
            triple: s.triple,
        });
    }

    Scan {
        lines,
        bracket_errors,
        unclosed: stack,
        unterminated,
    }
}

impl Scan {
    pub fn logical_lines(&self) -> Vec<LogicalLine> {
        let mut out: Vec<LogicalLine> = Vec::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if line.continuation {
                if let Some(current) = out.last_mut() {
                    if current.last + 1 == idx {
                        current.last = idx;
                        let extra = line.masked.trim();
                        if !extra.is_empty() {
                            if !current.code.is_empty() {
                                current.code.push(' ');
                            }
                            current.code.push_str(extra);
                        }
                        continue;
                    }
                }
            }
            if line.is_blank() {
                continue;
            }
            out.push(LogicalLine {
                first: idx,
                last: idx,
                indent: line.indent(),
                code: line.masked.trim().to_string(),
            });
        }
        out
    }

    pub fn is_clean(&self) -> bool {
        self.bracket_errors.is_empty() && self.unclosed.is_empty() && self.unterminated.is_empty()
    }
}

/// 深度为 0 的第一个冒号（跳过海象运算符 `:=`），返回字符下标
pub fn top_level_colon(code: &str) -> Option<usize> {
    let chars: Vec<char> = code.chars().collect();
    let mut depth: i32 = 0;
    for (i, c) in chars.iter().enumerate() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth <= 0 && chars.get(i + 1) != Some(&'=') => return Some(i),
            _ => {}
        }
    }
    None
}

/// masked 行中最后一个非空白字符之后的位置
pub fn code_end(masked: &str) -> usize {
    masked
        .chars()
        .collect::<Vec<_>>()
        .iter()
        .rposition(|c| !c.is_whitespace())
        .map(|p| p + 1)
        .unwrap_or(0)
}

/// masked 行中完整的代码单词：(起始字符下标, 单词)
pub fn code_words(masked: &str) -> Vec<(usize, String)> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    let mut prev_is_word = false;
    let mut prev_char = ' ';
    for (i, c) in masked.chars().enumerate() {
        let is_word = c.is_alphanumeric() || c == '_';
        if is_word {
            if !prev_is_word {
                start = i;
                current.clear();
                // 属性访问（obj.pritn）不算独立单词
                if prev_char == '.' {
                    current.push('.');
                }
            }
            current.push(c);
        } else if prev_is_word && !current.starts_with('.') {
            words.push((start, std::mem::take(&mut current)));
        }
        prev_is_word = is_word;
        prev_char = c;
    }
    if prev_is_word && !current.starts_with('.') {
        words.push((start, current));
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_strings_and_comments() {
        let s = scan("x = \"a(b\"  # note (\ny = 1");
        assert_eq!(s.lines[0].masked.trim_end(), "x = \"   \"");
        assert!(s.is_clean());
        assert_eq!(s.lines[0].masked.chars().count(), s.lines[0].text.chars().count());
        assert_eq!(s.lines[0].comment().as_deref(), Some("# note ("));
    }

    #[test]
    fn test_tracks_unclosed_brackets() {
        let s = scan("print(foo(1, 2)\n");
        assert_eq!(s.unclosed.len(), 1);
        assert_eq!(s.unclosed[0].ch, '(');
        assert_eq!(s.unclosed[0].col, 5);
    }

    #[test]
    fn test_reports_mismatch_and_unexpected_close() {
        let s = scan("a = [1, 2)\nb = 3]");
        assert!(matches!(
            s.bracket_errors[0],
            BracketError::Mismatch { close: ')', line: 0, .. }
        ));
        assert!(matches!(
            s.bracket_errors[1],
            BracketError::UnexpectedClose { close: ']', line: 1, .. }
        ));
    }

    #[test]
    fn test_unterminated_single_line_string() {
        let s = scan("print(\"hello)\nx = 1");
        assert_eq!(s.unterminated.len(), 1);
        assert!(!s.unterminated[0].triple);
        assert_eq!(s.unterminated[0].col, 6);
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let src = "def f():\n    \"\"\"Doc (with paren\n    more\"\"\"\n    return 1\n";
        let s = scan(src);
        assert!(s.is_clean());
        assert!(s.lines[2].continuation);
        let logical = s.logical_lines();
        assert_eq!(logical.len(), 3);
        assert_eq!(logical[1].first, 1);
        assert_eq!(logical[1].last, 2);
    }

    #[test]
    fn test_unterminated_triple_at_eof() {
        let s = scan("x = '''never closed\ny = 2\n");
        assert_eq!(s.unterminated.len(), 1);
        assert!(s.unterminated[0].triple);
    }

    #[test]
    fn test_bracket_continuation_joins_logical_line() {
        let s = scan("total = sum(\n    [1, 2],\n)\nprint(total)");
        let logical = s.logical_lines();
        assert_eq!(logical.len(), 2);
        assert_eq!(logical[0].code, "total = sum( [1, 2], )");
        assert_eq!(logical[1].first_word(), "print");
    }

    #[test]
    fn test_top_level_colon() {
        assert_eq!(top_level_colon("def f(x: int) -> int:"), Some(20));
        assert_eq!(top_level_colon("if (n := 3) > 2:"), Some(15));
        assert_eq!(top_level_colon("x = {1: 2}"), None);
    }

    #[test]
    fn test_code_words_skips_attributes() {
        let words = code_words("obj.pritn(pritn)");
        assert_eq!(words, vec![(0, "obj".to_string()), (10, "pritn".to_string())]);
    }

    #[test]
    fn test_indent_width_expands_tabs() {
        assert_eq!(indent_width("\tx"), 8);
        assert_eq!(indent_width("  \tx"), 8);
        assert_eq!(indent_width("    x"), 4);
    }
}
