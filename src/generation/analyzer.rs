use serde::{Deserialize, Serialize};

use crate::generation::lexer;
use crate::generation::syntax::{PythonSyntaxChecker, SyntaxChecker};
use crate::generation::types::{Candidate, Severity, Violation};

const MAX_LINE_LENGTH: usize = 120;
const MAX_FUNCTION_LINES: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub violations: Vec<Violation>,
    /// 0–100
    pub quality_score: f64,
}

impl Analysis {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let quality_score = quality_from(&violations);
        Self {
            violations,
            quality_score,
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Error)
    }
}

/// max(0, 100 − Σ 权重)
pub fn quality_from(violations: &[Violation]) -> f64 {
    let penalty: f64 = violations.iter().map(|v| v.severity.weight()).sum();
    (100.0 - penalty).max(0.0)
}

/// 静态分析能力，按目标语言可插拔
pub trait StaticAnalyzer: Send + Sync {
    fn analyze(&self, candidate: &Candidate) -> Analysis;
}

/// 基于行规则的 Python 分析器；非 Python 文件不产生违规
#[derive(Debug, Default, Clone)]
pub struct HeuristicAnalyzer {
    checker: PythonSyntaxChecker,
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_python(path: &str) -> bool {
        path.ends_with(".py") || !path.rsplit('/').next().unwrap_or(path).contains('.')
    }

    fn analyze_file(&self, path: &str, source: &str) -> Vec<Violation> {
        let mut violations = Vec::new();
        violations.extend(self.analyze_syntax(path, source));
        violations.extend(self.analyze_lines(path, source));
        violations.extend(self.analyze_structure(path, source));
        violations
    }

    fn analyze_syntax(&self, path: &str, source: &str) -> Vec<Violation> {
        self.checker
            .check(source)
            .into_iter()
            .map(|issue| Violation {
                kind: "syntax".to_string(),
                message: issue.message,
                file: path.to_string(),
                line: Some(issue.line),
                severity: Severity::Error,
            })
            .collect()
    }

    fn analyze_lines(&self, path: &str, source: &str) -> Vec<Violation> {
        let scan = lexer::scan(source);
        let mut violations = Vec::new();
        let mut push = |kind: &str, line: usize, severity: Severity, message: String| {
            violations.push(Violation {
                kind: kind.to_string(),
                message,
                file: path.to_string(),
                line: Some(line),
                severity,
            });
        };

        let mut saw_space_indent = false;
        let mut saw_tab_indent = false;
        for line in &scan.lines {
            let text = &line.text;
            let code = line.masked.trim();
            let n = line.number;

            if text.chars().count() > MAX_LINE_LENGTH {
                push(
                    "long_line",
                    n,
                    Severity::Info,
                    format!("line longer than {} characters", MAX_LINE_LENGTH),
                );
            }
            if text.ends_with(' ') || text.ends_with('\t') {
                push("trailing_whitespace", n, Severity::Info, "trailing whitespace".to_string());
            }
            if !line.continuation && !line.is_blank() {
                match text.chars().next() {
                    Some(' ') => saw_space_indent = true,
                    Some('\t') => saw_tab_indent = true,
                    _ => {}
                }
            }
            if line
                .comment()
                .is_some_and(|c| c.contains("TODO") || c.contains("FIXME"))
            {
                push("todo", n, Severity::Info, "TODO/FIXME comment found".to_string());
            }
            if code.is_empty() {
                continue;
            }
            if code == "except:" || code.starts_with("except:") {
                push(
                    "bare_except",
                    n,
                    Severity::Warning,
                    "bare `except:` swallows every exception".to_string(),
                );
            }
            if code.starts_with("from ") && code.ends_with("import *") {
                push("wildcard_import", n, Severity::Warning, "wildcard import".to_string());
            }
            let words = lexer::code_words(&line.masked);
            for (start, word) in &words {
                if (word == "eval" || word == "exec")
                    && line.masked.chars().skip(start + word.len()).find(|c| !c.is_whitespace()) == Some('(')
                {
                    push(
                        "dangerous_call",
                        n,
                        Severity::Warning,
                        format!("call to `{}`", word),
                    );
                }
            }
            if code.starts_with("def ") || code.starts_with("async def ") {
                if code.contains("=[]") || code.contains("= []") || code.contains("={}") || code.contains("= {}") {
                    push(
                        "mutable_default",
                        n,
                        Severity::Warning,
                        "mutable default argument".to_string(),
                    );
                }
            }
        }
        if saw_space_indent && saw_tab_indent {
            push(
                "mixed_indentation",
                1,
                Severity::Warning,
                "file mixes tab and space indentation".to_string(),
            );
        }
        violations
    }

    fn analyze_structure(&self, path: &str, source: &str) -> Vec<Violation> {
        let scan = lexer::scan(source);
        let logical = scan.logical_lines();
        let mut violations = Vec::new();
        for (i, line) in logical.iter().enumerate() {
            let is_def = matches!(line.first_word(), "def")
                || (line.first_word() == "async" && line.code.starts_with("async def"));
            if !is_def {
                continue;
            }
            let end = logical[i + 1..]
                .iter()
                .find(|l| l.indent <= line.indent)
                .map(|l| l.first)
                .unwrap_or(scan.lines.len());
            let length = end.saturating_sub(line.first);
            if length > MAX_FUNCTION_LINES {
                violations.push(Violation {
                    kind: "long_function".to_string(),
                    message: format!("function spans {} lines", length),
                    file: path.to_string(),
                    line: Some(line.number()),
                    severity: Severity::Info,
                });
            }
        }
        violations
    }
}

impl StaticAnalyzer for HeuristicAnalyzer {
    fn analyze(&self, candidate: &Candidate) -> Analysis {
        let violations = candidate
            .files()
            .filter(|(path, _)| Self::is_python(path))
            .flat_map(|(path, source)| self.analyze_file(path, source))
            .collect();
        Analysis::from_violations(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(src: &str) -> Analysis {
        HeuristicAnalyzer::new().analyze(&Candidate::single("main.py", src))
    }

    fn kinds(a: &Analysis) -> Vec<&str> {
        a.violations.iter().map(|v| v.kind.as_str()).collect()
    }

    #[test]
    fn test_clean_code_scores_full() {
        let a = analyze("def main():\n    print('hi')\n\n\nmain()\n");
        assert!(a.violations.is_empty());
        assert_eq!(a.quality_score, 100.0);
    }

    #[test]
    fn test_syntax_error_is_error_severity() {
        let a = analyze("def main()\n    return 1\n");
        assert!(a.has_errors());
        assert!(kinds(&a).contains(&"syntax"));
    }

    #[test]
    fn test_pattern_rules() {
        let src = "from os import *\n\ndef f(x=[]):\n    try:\n        return eval(x)\n    except:\n        pass\n";
        let a = analyze(src);
        let k = kinds(&a);
        assert!(k.contains(&"wildcard_import"));
        assert!(k.contains(&"mutable_default"));
        assert!(k.contains(&"dangerous_call"));
        assert!(k.contains(&"bare_except"));
        assert_eq!(a.quality_score, 80.0);
    }

    #[test]
    fn test_rules_ignore_strings() {
        let a = analyze("msg = \"eval(x) and except: and # TODO\"\nprint(msg)\n");
        assert!(a.violations.is_empty(), "{:?}", a.violations);
    }

    #[test]
    fn test_non_python_files_are_skipped() {
        let a = HeuristicAnalyzer::new().analyze(&Candidate::single("run.sh", "if [ 1 \n"));
        assert!(a.violations.is_empty());
    }

    #[test]
    fn test_quality_floor_is_zero() {
        let violations: Vec<Violation> = (0..10)
            .map(|i| Violation {
                kind: "syntax".into(),
                message: "x".into(),
                file: "main.py".into(),
                line: Some(i),
                severity: Severity::Error,
            })
            .collect();
        assert_eq!(quality_from(&violations), 0.0);
    }
}
