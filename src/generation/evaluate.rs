//! 候选评估流水线：提取 → 语法修复 → 静态分析 → 桩函数检测 → 打分
//!
//! 主循环与自动修复共用同一条流水线。

use std::sync::Arc;

use crate::core::StepError;
use crate::generation::analyzer::{HeuristicAnalyzer, StaticAnalyzer};
use crate::generation::extractor::ResponseExtractor;
use crate::generation::incomplete;
use crate::generation::repair::{RepairOutcome, SyntaxRepairer};
use crate::generation::scorer::{self, ScoreInput};
use crate::generation::types::{
    Candidate, Classification, IncompleteFunction, ScoredCandidate, SyntaxStatus,
    ValidationSummary, Violation,
};

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub classified_as: Classification,
    /// 修复后的候选；提取失败时为 None
    pub candidate: Option<Candidate>,
    pub syntax: Option<SyntaxStatus>,
    pub violations: Vec<Violation>,
    pub static_quality: f64,
    pub incomplete: Vec<IncompleteFunction>,
    pub score: f64,
    pub explanation: String,
    pub issues: Vec<String>,
    /// 本次评估对应的可恢复错误（提取失败或语法无法修复）
    pub error: Option<StepError>,
}

impl Evaluation {
    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            classified_as: self.classified_as,
            syntax: self.syntax,
            score: self.score,
            explanation: self.explanation.clone(),
            violations: self.violations.clone(),
            incomplete: self.incomplete.clone(),
            issues: self.issues.clone(),
        }
    }

    pub fn scored(&self, iteration_index: usize) -> Option<ScoredCandidate> {
        self.candidate.as_ref().map(|candidate| ScoredCandidate {
            candidate: candidate.clone(),
            score: self.score,
            explanation: self.explanation.clone(),
            violations: self.violations.clone(),
            iteration_index,
            incomplete: self.incomplete.clone(),
        })
    }
}

#[derive(Clone)]
pub struct Evaluator {
    extractor: ResponseExtractor,
    repairer: SyntaxRepairer,
    analyzer: Arc<dyn StaticAnalyzer>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(ResponseExtractor::default(), Arc::new(HeuristicAnalyzer::new()))
    }
}

impl Evaluator {
    pub fn new(extractor: ResponseExtractor, analyzer: Arc<dyn StaticAnalyzer>) -> Self {
        Self {
            extractor,
            repairer: SyntaxRepairer::new(),
            analyzer,
        }
    }

    pub fn extractor(&self) -> &ResponseExtractor {
        &self.extractor
    }

    pub fn evaluate(&self, raw: &str, prompt: Option<&str>) -> Evaluation {
        let extraction = self.extractor.extract(raw, prompt);
        let mut issues = extraction.issues.clone();
        let candidate = match extraction.candidate {
            Some(c) if !c.is_empty() => c,
            _ => {
                if issues.is_empty() {
                    issues.push("no code found in response".to_string());
                }
                let s = scorer::score(ScoreInput {
                    extracted: false,
                    static_quality: 0.0,
                    incomplete_count: 0,
                    completion_merged: false,
                });
                return Evaluation {
                    classified_as: extraction.classified_as,
                    candidate: None,
                    syntax: None,
                    violations: Vec::new(),
                    static_quality: 0.0,
                    incomplete: Vec::new(),
                    score: s.value,
                    explanation: s.explanation,
                    error: Some(StepError::ExtractionFailure(issues.clone())),
                    issues,
                };
            }
        };

        let (candidate, syntax, unrepaired) = self.repair(candidate);
        issues.extend(unrepaired.iter().cloned());
        let incomplete = incomplete::detect(&candidate);
        let analysis = self.analyzer.analyze(&candidate);
        let s = scorer::score(ScoreInput {
            extracted: true,
            static_quality: analysis.quality_score,
            incomplete_count: incomplete.len(),
            completion_merged: false,
        });
        let error = (!unrepaired.is_empty()).then(|| StepError::SyntaxError(unrepaired.join("; ")));

        Evaluation {
            classified_as: extraction.classified_as,
            candidate: Some(candidate),
            syntax: Some(syntax),
            violations: analysis.violations,
            static_quality: analysis.quality_score,
            incomplete,
            score: s.value,
            explanation: s.explanation,
            issues,
            error,
        }
    }

    /// 补全合并之后重新打分；merged 为真时计入补全加分
    pub fn rescore(
        &self,
        candidate: &Candidate,
        still_incomplete: &[IncompleteFunction],
        merged: bool,
        iteration_index: usize,
    ) -> ScoredCandidate {
        let analysis = self.analyzer.analyze(candidate);
        let s = scorer::score(ScoreInput {
            extracted: !candidate.is_empty(),
            static_quality: analysis.quality_score,
            incomplete_count: still_incomplete.len(),
            completion_merged: merged,
        });
        ScoredCandidate {
            candidate: candidate.clone(),
            score: s.value,
            explanation: s.explanation,
            violations: analysis.violations,
            iteration_index,
            incomplete: still_incomplete.to_vec(),
        }
    }

    /// 逐个 Python 文件修复；无法修复的文件保留原文并返回原因
    fn repair(&self, candidate: Candidate) -> (Candidate, SyntaxStatus, Vec<String>) {
        let mut repaired_any = false;
        let mut failures = Vec::new();
        let fixed = candidate.map_sources(|path, source| {
            if !HeuristicAnalyzer::is_python(path) {
                return source.to_string();
            }
            match self.repairer.repair(source) {
                RepairOutcome::AlreadyValid => source.to_string(),
                RepairOutcome::Repaired { text, fixes } => {
                    tracing::info!(file = path, fixes = ?fixes, "candidate repaired");
                    repaired_any = true;
                    text
                }
                RepairOutcome::Unrepairable { reason } => {
                    tracing::warn!(file = path, reason = %reason, "syntax repair failed");
                    failures.push(format!("{}: {}", path, reason));
                    source.to_string()
                }
            }
        });
        let status = if !failures.is_empty() {
            SyntaxStatus::Invalid
        } else if repaired_any {
            SyntaxStatus::Repaired
        } else {
            SyntaxStatus::Valid
        };
        (fixed, status, failures)
    }
}
