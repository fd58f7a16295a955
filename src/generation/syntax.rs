//! 语法检查
//!
//! SyntaxChecker 按目标语言可插拔；内置 PythonSyntaxChecker 基于行扫描检查
//! 字符串闭合、括号配对、块头冒号、块体缩进与常见关键字拼写错误。

use std::fmt;

use crate::generation::lexer::{self, LogicalLine, Scan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxIssueKind {
    UnterminatedString,
    UnbalancedDelimiter,
    MissingColon,
    MissingBlockBody,
    UnexpectedIndent,
    InconsistentDedent,
    KeywordTypo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub kind: SyntaxIssueKind,
    /// 1-based
    pub line: usize,
    /// 语句最后一个物理行（1-based），块体缺失时在其后插入
    pub end_line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

pub trait SyntaxChecker: Send + Sync {
    fn check(&self, source: &str) -> Vec<SyntaxIssue>;

    fn is_valid(&self, source: &str) -> bool {
        self.check(source).is_empty()
    }
}

/// 以冒号结尾、需要缩进块体的语句关键字
pub const BLOCK_KEYWORDS: [&str; 11] = [
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
];

/// 出现在语句开头时一定是语法错误的拼写
pub const STATEMENT_TYPOS: [(&str, &str); 8] = [
    ("dfe", "def"),
    ("calss", "class"),
    ("improt", "import"),
    ("retrun", "return"),
    ("reutrn", "return"),
    ("whiel", "while"),
    ("esle", "else"),
    ("elfi", "elif"),
];

/// 块头关键字；`async def` / `async for` / `async with` 取第二个词
pub fn block_keyword(line: &LogicalLine) -> Option<&'static str> {
    let word = line.first_word();
    let word = if word == "async" {
        line.code["async".len()..]
            .trim_start()
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or("")
    } else {
        word
    };
    BLOCK_KEYWORDS.iter().copied().find(|k| *k == word)
}

/// 语句开头的拼写错误：后面紧跟标识符、字面量或冒号
pub fn statement_typo(line: &LogicalLine) -> Option<(&'static str, &'static str)> {
    let word = line.first_word();
    let (typo, fix) = STATEMENT_TYPOS.iter().copied().find(|(t, _)| *t == word)?;
    let rest = &line.code[word.len()..];
    let next = rest.trim_start().chars().next();
    let spaced = rest.starts_with(char::is_whitespace);
    let bad = match next {
        Some(':') => true,
        Some(c) if spaced => c.is_alphanumeric() || c == '_' || c == '"' || c == '\'',
        _ => false,
    };
    bad.then_some((typo, fix))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonSyntaxChecker;

impl PythonSyntaxChecker {
    pub fn new() -> Self {
        Self
    }

    fn lexical_issues(scan: &Scan, issues: &mut Vec<SyntaxIssue>) {
        for u in &scan.unterminated {
            let what = if u.triple { "triple-quoted string" } else { "string literal" };
            issues.push(SyntaxIssue {
                kind: SyntaxIssueKind::UnterminatedString,
                line: u.line + 1,
                end_line: u.line + 1,
                message: format!("unterminated {}", what),
            });
        }
        for e in &scan.bracket_errors {
            let (line, message) = match e {
                lexer::BracketError::Mismatch { open, close, line, .. } => (
                    *line,
                    format!(
                        "closing '{}' does not match '{}' opened on line {}",
                        close,
                        open.ch,
                        open.line + 1
                    ),
                ),
                lexer::BracketError::UnexpectedClose { close, line, .. } => {
                    (*line, format!("unmatched '{}'", close))
                }
            };
            issues.push(SyntaxIssue {
                kind: SyntaxIssueKind::UnbalancedDelimiter,
                line: line + 1,
                end_line: line + 1,
                message,
            });
        }
        for open in &scan.unclosed {
            issues.push(SyntaxIssue {
                kind: SyntaxIssueKind::UnbalancedDelimiter,
                line: open.line + 1,
                end_line: open.line + 1,
                message: format!("'{}' was never closed", open.ch),
            });
        }
    }

    fn structural_issues(logical: &[LogicalLine], issues: &mut Vec<SyntaxIssue>) {
        let mut indents: Vec<usize> = vec![0];
        // 等待块体的块头：(首行, 末行)
        let mut pending_header: Option<(usize, usize)> = None;

        for line in logical {
            let top = indents.last().copied().unwrap_or(0);
            if let Some((first, last)) = pending_header.take() {
                if line.indent > top {
                    indents.push(line.indent);
                } else {
                    issues.push(missing_body(first, last));
                    Self::dedent(&mut indents, line, issues);
                }
            } else if line.indent > top {
                issues.push(SyntaxIssue {
                    kind: SyntaxIssueKind::UnexpectedIndent,
                    line: line.number(),
                    end_line: line.last + 1,
                    message: "unexpected indent".to_string(),
                });
                indents.push(line.indent);
            } else {
                Self::dedent(&mut indents, line, issues);
            }

            if let Some((typo, fix)) = statement_typo(line) {
                issues.push(SyntaxIssue {
                    kind: SyntaxIssueKind::KeywordTypo,
                    line: line.number(),
                    end_line: line.last + 1,
                    message: format!("invalid syntax: '{}' (did you mean '{}'?)", typo, fix),
                });
            }

            if let Some(keyword) = block_keyword(line) {
                match lexer::top_level_colon(&line.code) {
                    None => issues.push(SyntaxIssue {
                        kind: SyntaxIssueKind::MissingColon,
                        line: line.number(),
                        end_line: line.last + 1,
                        message: format!("expected ':' after '{}' statement", keyword),
                    }),
                    Some(pos) => {
                        let inline_body: String = line.code.chars().skip(pos + 1).collect();
                        if inline_body.trim().is_empty() {
                            pending_header = Some((line.first, line.last));
                        }
                    }
                }
            }
        }

        if let Some((first, last)) = pending_header {
            issues.push(missing_body(first, last));
        }
    }

    fn dedent(indents: &mut Vec<usize>, line: &LogicalLine, issues: &mut Vec<SyntaxIssue>) {
        while indents.len() > 1 && indents.last().is_some_and(|top| *top > line.indent) {
            indents.pop();
        }
        if indents.last().copied().unwrap_or(0) != line.indent {
            issues.push(SyntaxIssue {
                kind: SyntaxIssueKind::InconsistentDedent,
                line: line.number(),
                end_line: line.last + 1,
                message: "unindent does not match any outer indentation level".to_string(),
            });
            indents.push(line.indent);
        }
    }
}

fn missing_body(first: usize, last: usize) -> SyntaxIssue {
    SyntaxIssue {
        kind: SyntaxIssueKind::MissingBlockBody,
        line: first + 1,
        end_line: last + 1,
        message: format!("expected an indented block after line {}", first + 1),
    }
}

impl SyntaxChecker for PythonSyntaxChecker {
    fn check(&self, source: &str) -> Vec<SyntaxIssue> {
        let scan = lexer::scan(source);
        let mut issues = Vec::new();
        Self::lexical_issues(&scan, &mut issues);
        // 括号或字符串未闭合时逻辑行划分不可靠，结构检查只在词法干净时进行
        if scan.unterminated.is_empty() && scan.unclosed.is_empty() {
            Self::structural_issues(&scan.logical_lines(), &mut issues);
        }
        issues.sort_by_key(|i| i.line);
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<SyntaxIssueKind> {
        PythonSyntaxChecker::new()
            .check(src)
            .into_iter()
            .map(|i| i.kind)
            .collect()
    }

    #[test]
    fn test_valid_program() {
        let src = r#"import sys


class Greeter:
    """Says hello."""

    def __init__(self, name: str) -> None:
        self.name = name

    def greet(self) -> str:
        if not self.name:
            return "hello"
        elif self.name == "x": return "x"
        else:
            return f"hello {self.name}"


def main():
    items = [
        1,
        2,
    ]
    for i in items:
        print(Greeter(str(i)).greet())


if __name__ == "__main__":
    main()
"#;
        assert_eq!(kinds(src), vec![]);
    }

    #[test]
    fn test_missing_colon() {
        assert_eq!(
            kinds("def main()\n    print(1)\n"),
            vec![SyntaxIssueKind::MissingColon, SyntaxIssueKind::UnexpectedIndent]
        );
    }

    #[test]
    fn test_missing_block_body() {
        let issues = PythonSyntaxChecker::new().check("def main():\nprint(1)\n");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, SyntaxIssueKind::MissingBlockBody);
        assert_eq!(issues[0].end_line, 1);
    }

    #[test]
    fn test_body_missing_at_eof() {
        assert_eq!(
            kinds("class Empty:\n"),
            vec![SyntaxIssueKind::MissingBlockBody]
        );
    }

    #[test]
    fn test_inconsistent_dedent() {
        assert_eq!(
            kinds("if True:\n        x = 1\n    y = 2\n"),
            vec![SyntaxIssueKind::InconsistentDedent]
        );
    }

    #[test]
    fn test_keyword_typo() {
        assert_eq!(
            kinds("dfe main():\n    retrun 1\n"),
            vec![
                SyntaxIssueKind::KeywordTypo,
                SyntaxIssueKind::UnexpectedIndent,
                SyntaxIssueKind::KeywordTypo
            ]
        );
        // 单独的名字是合法表达式
        assert_eq!(kinds("retrun\n"), vec![]);
    }

    #[test]
    fn test_unbalanced_and_unterminated() {
        assert_eq!(
            kinds("print(\"hi\"\n"),
            vec![SyntaxIssueKind::UnbalancedDelimiter]
        );
        assert_eq!(
            kinds("x = 'abc\n"),
            vec![SyntaxIssueKind::UnterminatedString]
        );
    }

    #[test]
    fn test_async_def_and_walrus() {
        let src = "async def run():\n    if (n := 3) > 2:\n        return n\n";
        assert!(PythonSyntaxChecker::new().is_valid(src));
    }
}
