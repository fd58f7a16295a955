//! 确定性的语法修复
//!
//! 只在候选无法解析时运行，按固定顺序应用文本修复：
//! 关键字拼写 → 闭合字符串 → 括号配平 → 块头补冒号 → 空块补 `pass`。
//! 全部修复后重新检查，仍无法解析则放弃，调用方保留原文。

use crate::generation::lexer::{self, BracketError};
use crate::generation::syntax::{
    block_keyword, PythonSyntaxChecker, SyntaxChecker, SyntaxIssueKind, STATEMENT_TYPOS,
};

/// 语句位置以外也修正的拼写
const NAME_TYPOS: [(&str, &str); 4] = [
    ("pritn", "print"),
    ("Ture", "True"),
    ("Flase", "False"),
    ("Noen", "None"),
];

/// 单个修复步骤的迭代上限
const MAX_PASSES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    AlreadyValid,
    Repaired { text: String, fixes: Vec<String> },
    Unrepairable { reason: String },
}

type RepairStep = fn(&str) -> Option<(String, String)>;

#[derive(Debug, Default, Clone)]
pub struct SyntaxRepairer {
    checker: PythonSyntaxChecker,
}

impl SyntaxRepairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repair(&self, source: &str) -> RepairOutcome {
        if self.checker.is_valid(source) {
            return RepairOutcome::AlreadyValid;
        }

        let steps: [RepairStep; 5] = [
            fix_typos,
            close_strings,
            balance_delimiters,
            add_block_terminators,
            insert_missing_bodies,
        ];
        let mut text = source.to_string();
        let mut fixes = Vec::new();
        for step in steps {
            if let Some((fixed, description)) = step(&text) {
                text = fixed;
                fixes.push(description);
            }
        }

        let remaining = self.checker.check(&text);
        match remaining.first() {
            None => {
                tracing::debug!(fixes = ?fixes, "syntax repaired");
                RepairOutcome::Repaired { text, fixes }
            }
            Some(issue) => RepairOutcome::Unrepairable {
                reason: issue.to_string(),
            },
        }
    }

    /// 修复成功返回修复后的文本，否则原样返回
    pub fn apply(&self, source: &str) -> String {
        match self.repair(source) {
            RepairOutcome::Repaired { text, .. } => text,
            RepairOutcome::AlreadyValid | RepairOutcome::Unrepairable { .. } => source.to_string(),
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

fn insert_at(line: &str, col: usize, s: &str) -> String {
    let mut chars: Vec<char> = line.chars().collect();
    let col = col.min(chars.len());
    chars.splice(col..col, s.chars());
    chars.into_iter().collect()
}

fn replace_char(line: &str, col: usize, with: Option<char>) -> String {
    line.chars()
        .enumerate()
        .filter_map(|(i, c)| if i == col { with } else { Some(c) })
        .collect()
}

/// 去掉行尾空白后追加
fn append_to_line(line: &str, s: &str) -> String {
    let masked_end = lexer::code_end(&lexer::scan(line).lines[0].masked);
    let trimmed_len = line.trim_end().chars().count();
    // 行尾有注释时插在注释之前
    if masked_end < trimmed_len {
        insert_at(line, masked_end, s)
    } else {
        format!("{}{}", line.trim_end(), s)
    }
}

fn fix_typos(text: &str) -> Option<(String, String)> {
    let scan = lexer::scan(text);
    let mut fixed_words = Vec::new();
    let lines: Vec<String> = scan
        .lines
        .iter()
        .map(|line| {
            let mut out: Vec<char> = line.text.chars().collect();
            // 从后往前替换，前面的下标保持有效
            for (start, word) in lexer::code_words(&line.masked).into_iter().rev() {
                let replacement = STATEMENT_TYPOS
                    .iter()
                    .chain(NAME_TYPOS.iter())
                    .find(|(typo, _)| *typo == word)
                    .map(|(_, fix)| *fix);
                if let Some(fix) = replacement {
                    let end = start + word.chars().count();
                    out.splice(start..end, fix.chars());
                    fixed_words.push(format!("{}→{}", word, fix));
                }
            }
            out.into_iter().collect()
        })
        .collect();

    if fixed_words.is_empty() {
        return None;
    }
    fixed_words.reverse();
    Some((lines.join("\n"), format!("corrected typos: {}", fixed_words.join(", "))))
}

fn close_strings(text: &str) -> Option<(String, String)> {
    let mut text = text.to_string();
    let mut closed = 0;
    for _ in 0..MAX_PASSES {
        let scan = lexer::scan(&text);
        let Some(u) = scan.unterminated.first().copied() else {
            break;
        };
        let mut lines = split_lines(&text);
        if u.triple {
            let quotes: String = std::iter::repeat(u.quote).take(3).collect();
            let last = lines
                .iter()
                .rposition(|l| !l.trim().is_empty())
                .unwrap_or(u.line);
            lines[last] = format!("{}{}", lines[last].trim_end(), quotes);
        } else {
            lines[u.line] = format!("{}{}", lines[u.line].trim_end(), u.quote);
        }
        text = lines.join("\n");
        closed += 1;
    }
    (closed > 0).then(|| (text, format!("closed {} unterminated string(s)", closed)))
}

fn balance_delimiters(text: &str) -> Option<(String, String)> {
    let mut text = text.to_string();
    let mut fixes = 0;

    for _ in 0..MAX_PASSES {
        let scan = lexer::scan(&text);
        let Some(err) = scan.bracket_errors.first().copied() else {
            break;
        };
        let mut lines = split_lines(&text);
        match err {
            BracketError::Mismatch { open, line, col, .. } => {
                lines[line] = replace_char(&lines[line], col, Some(lexer::closer_for(open.ch)));
            }
            BracketError::UnexpectedClose { line, col, .. } => {
                lines[line] = replace_char(&lines[line], col, None);
            }
        }
        text = lines.join("\n");
        fixes += 1;
    }

    let scan = lexer::scan(&text);
    if !scan.unclosed.is_empty() {
        let mut lines = split_lines(&text);
        let last_code = scan
            .lines
            .iter()
            .rposition(|l| !l.is_blank())
            .unwrap_or(0);
        // 从最内层开始，外层括号排在后面
        for open in scan.unclosed.iter().rev() {
            let opening = &scan.lines[open.line].masked;
            let tail = opening.trim_end();
            let target = if tail.ends_with(|c| "([{,\\".contains(c)) {
                last_code
            } else {
                open.line
            };
            lines[target] = append_to_line(&lines[target], &lexer::closer_for(open.ch).to_string());
            fixes += 1;
        }
        text = lines.join("\n");
    }

    (fixes > 0).then(|| (text, format!("balanced {} delimiter(s)", fixes)))
}

fn add_block_terminators(text: &str) -> Option<(String, String)> {
    let scan = lexer::scan(text);
    if !scan.is_clean() {
        return None;
    }
    let mut lines = split_lines(text);
    let mut added = 0;
    for logical in scan.logical_lines() {
        if block_keyword(&logical).is_some() && lexer::top_level_colon(&logical.code).is_none() {
            let last = logical.last;
            let end = lexer::code_end(&scan.lines[last].masked);
            lines[last] = insert_at(&lines[last], end, ":");
            added += 1;
        }
    }
    (added > 0).then(|| (lines.join("\n"), format!("added {} missing ':'", added)))
}

fn insert_missing_bodies(text: &str) -> Option<(String, String)> {
    let issues = PythonSyntaxChecker::new().check(text);
    let mut targets: Vec<usize> = issues
        .iter()
        .filter(|i| i.kind == SyntaxIssueKind::MissingBlockBody)
        .map(|i| i.end_line)
        .collect();
    if targets.is_empty() {
        return None;
    }
    targets.sort_unstable();
    targets.dedup();

    let scan = lexer::scan(text);
    let mut lines = split_lines(text);
    for end_line in targets.iter().rev() {
        let header_indent = scan
            .logical_lines()
            .into_iter()
            .find(|l| l.last + 1 == *end_line)
            .map(|l| l.indent)
            .unwrap_or(0);
        let body = format!("{}pass", " ".repeat(header_indent + 4));
        lines.insert(*end_line, body);
    }
    Some((
        lines.join("\n"),
        format!("inserted {} missing block body(ies)", targets.len()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repaired(src: &str) -> String {
        match SyntaxRepairer::new().repair(src) {
            RepairOutcome::Repaired { text, .. } => text,
            other => panic!("expected Repaired, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_code_is_untouched() {
        let src = "def f():\n    return 1\n";
        assert_eq!(SyntaxRepairer::new().repair(src), RepairOutcome::AlreadyValid);
        assert_eq!(SyntaxRepairer::new().apply(src), src);
    }

    #[test]
    fn test_closes_call_on_opening_line() {
        assert_eq!(
            repaired("print(\"hi\"\nprint(\"bye\")\n"),
            "print(\"hi\")\nprint(\"bye\")\n"
        );
    }

    #[test]
    fn test_closes_string_then_paren() {
        assert_eq!(repaired("print(\"hello\n"), "print(\"hello\")\n");
    }

    #[test]
    fn test_multiline_call_closed_at_last_line() {
        assert_eq!(
            repaired("total = sum([\n    1,\n    2\n"),
            "total = sum([\n    1,\n    2])\n"
        );
    }

    #[test]
    fn test_mismatched_closer_replaced() {
        assert_eq!(repaired("x = [1, 2)\n"), "x = [1, 2]\n");
    }

    #[test]
    fn test_missing_colon_and_body() {
        assert_eq!(
            repaired("def main()\n    print(1)\n\nclass Empty:\n"),
            "def main():\n    print(1)\n\nclass Empty:\n    pass\n"
        );
    }

    #[test]
    fn test_colon_inserted_before_comment() {
        assert_eq!(
            repaired("if x > 1  # check\n    y = 2\n"),
            "if x > 1:  # check\n    y = 2\n"
        );
    }

    #[test]
    fn test_typos_outside_strings_only() {
        assert_eq!(
            repaired("dfe main():\n    pritn(\"pritn\")\n    retrun Ture\n"),
            "def main():\n    print(\"pritn\")\n    return True\n"
        );
    }

    #[test]
    fn test_unrepairable_keeps_original() {
        let src = "if True:\n        x = 1\n    y = 2\n";
        let repairer = SyntaxRepairer::new();
        assert!(matches!(
            repairer.repair(src),
            RepairOutcome::Unrepairable { .. }
        ));
        assert_eq!(repairer.apply(src), src);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let repairer = SyntaxRepairer::new();
        let samples = [
            "def f(\n    return 1\n",
            "print('a\nx = [1, 2)\n",
            "whiel True\n    break\n",
            "class A:\n    def m(self)\n",
            "valid = 1\n",
            "s = '''open\n",
        ];
        for s in samples {
            let once = repairer.apply(s);
            assert_eq!(repairer.apply(&once), once, "not idempotent for {:?}", s);
        }
    }
}
