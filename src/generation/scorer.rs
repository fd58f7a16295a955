//! 综合质量分
//!
//! score = 30×extracted + 0.7×staticQuality − min(30, 10×桩函数数) + 15×已合并补全，限定在 [0, 100]。
//! 没有提取到候选时直接为 0。纯函数，不持有状态。

use serde::{Deserialize, Serialize};

pub const EXTRACTION_WEIGHT: f64 = 30.0;
pub const STATIC_QUALITY_WEIGHT: f64 = 0.7;
pub const PENALTY_PER_INCOMPLETE: f64 = 10.0;
pub const MAX_INCOMPLETE_PENALTY: f64 = 30.0;
pub const COMPLETION_BONUS: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub extracted: bool,
    /// 0–100
    pub static_quality: f64,
    pub incomplete_count: usize,
    /// 本轮补全已合并
    pub completion_merged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub explanation: String,
}

pub fn score(input: ScoreInput) -> Score {
    if !input.extracted {
        return Score {
            value: 0.0,
            explanation: "no candidate extracted".to_string(),
        };
    }
    let quality = input.static_quality.clamp(0.0, 100.0);
    let penalty =
        (PENALTY_PER_INCOMPLETE * input.incomplete_count as f64).min(MAX_INCOMPLETE_PENALTY);
    let bonus = if input.completion_merged {
        COMPLETION_BONUS
    } else {
        0.0
    };
    let raw = EXTRACTION_WEIGHT + STATIC_QUALITY_WEIGHT * quality - penalty + bonus;
    let value = raw.clamp(0.0, 100.0);

    let mut explanation = format!(
        "extracted {:.0} + static {:.1} (quality {:.0})",
        EXTRACTION_WEIGHT,
        STATIC_QUALITY_WEIGHT * quality,
        quality
    );
    if penalty > 0.0 {
        explanation.push_str(&format!(
            " - incomplete {:.0} ({} stub(s))",
            penalty, input.incomplete_count
        ));
    }
    if bonus > 0.0 {
        explanation.push_str(&format!(" + completion {:.0}", bonus));
    }
    explanation.push_str(&format!(" = {:.1}", value));

    Score { value, explanation }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::analyzer::quality_from;
    use crate::generation::types::{Severity, Violation};

    fn input(static_quality: f64, incomplete_count: usize, completion_merged: bool) -> ScoreInput {
        ScoreInput {
            extracted: true,
            static_quality,
            incomplete_count,
            completion_merged,
        }
    }

    #[test]
    fn test_not_extracted_is_zero() {
        let s = score(ScoreInput {
            extracted: false,
            static_quality: 100.0,
            incomplete_count: 0,
            completion_merged: true,
        });
        assert_eq!(s.value, 0.0);
    }

    #[test]
    fn test_clean_candidate_scores_100() {
        assert_eq!(score(input(100.0, 0, false)).value, 100.0);
    }

    #[test]
    fn test_penalty_is_capped() {
        assert_eq!(score(input(100.0, 1, false)).value, 90.0);
        assert_eq!(score(input(100.0, 3, false)).value, 70.0);
        assert_eq!(score(input(100.0, 7, false)).value, 70.0);
    }

    #[test]
    fn test_bonus_is_clamped_at_100() {
        assert_eq!(score(input(100.0, 0, true)).value, 100.0);
        assert_eq!(score(input(50.0, 1, true)).value, 70.0);
    }

    #[test]
    fn test_floor_is_zero() {
        assert_eq!(score(input(0.0, 3, false)).value, 0.0);
    }

    #[test]
    fn test_monotonic_in_violation_count() {
        let mut violations = Vec::new();
        let mut previous = f64::MAX;
        for i in 0..12 {
            let severity = match i % 3 {
                0 => Severity::Error,
                1 => Severity::Warning,
                _ => Severity::Info,
            };
            violations.push(Violation {
                kind: "rule".into(),
                message: "m".into(),
                file: "main.py".into(),
                line: Some(i),
                severity,
            });
            let value = score(input(quality_from(&violations), 1, false)).value;
            assert!(value <= previous, "score rose at {} violations", i + 1);
            previous = value;
        }
    }
}
