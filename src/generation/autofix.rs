//! 自动修复循环
//!
//! 把执行失败反馈给模型，取回修订版后重新走评估、桩函数补全与执行校验。
//! 最多 max_attempts 次，第一次通过即停止；每次尝试都产生一条 AutoFix 历史记录。

use crate::core::{GenerationStep, StepType};
use crate::generation::backend::ModelBackend;
use crate::generation::evaluate::Evaluator;
use crate::generation::executor::{failure_text, ExecutionVerifier};
use crate::generation::incomplete::IncompleteFunctionResolver;
use crate::generation::prompt::PromptComposer;
use crate::generation::types::{ExecutionOutcome, ScoredCandidate, Verdict};

/// 修复循环用到的协作者
pub struct FixTools<'a> {
    pub backend: &'a ModelBackend,
    pub composer: &'a PromptComposer,
    pub evaluator: &'a Evaluator,
    pub verifier: &'a ExecutionVerifier,
    /// None 表示不补全修订版中的桩函数
    pub resolver: Option<&'a IncompleteFunctionResolver>,
}

#[derive(Debug, Clone)]
pub struct FixReport {
    pub steps: Vec<GenerationStep>,
    pub attempts: u32,
    /// 执行通过的修订版
    pub fixed: Option<ScoredCandidate>,
    /// 最后一次校验的判定（未修复时即最终失败原因）
    pub last_verdict: Verdict,
}

impl FixReport {
    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct AutoFixLoop {
    max_attempts: u32,
}

impl AutoFixLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub async fn run(
        &self,
        tools: &FixTools<'_>,
        request: &str,
        iteration: usize,
        failing: &ScoredCandidate,
        verdict: &Verdict,
        outcome: Option<&ExecutionOutcome>,
    ) -> FixReport {
        let mut steps = Vec::new();
        let mut current = failing.clone();
        let mut current_verdict = verdict.clone();
        let mut current_error = failure_text(verdict, outcome);
        let mut previous_errors: Vec<String> = Vec::new();
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            let prompt = tools
                .composer
                .fix(request, &current.candidate, &current_error, &previous_errors);
            tracing::info!(iteration, attempt = attempts, "auto-fix attempt");

            let raw = match tools.backend.generate(&prompt).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(iteration, attempt = attempts, error = %e, "auto-fix backend error");
                    steps.push(
                        GenerationStep::new(StepType::AutoFix, iteration)
                            .with_attempt(attempts)
                            .with_prompt(prompt)
                            .with_feedback(format!("backend error: {}", e)),
                    );
                    continue;
                }
            };

            let evaluation = tools.evaluator.evaluate(&raw, Some(prompt.as_str()));
            let step = GenerationStep::new(StepType::AutoFix, iteration)
                .with_attempt(attempts)
                .with_prompt(prompt)
                .with_raw_response(raw)
                .with_validation(evaluation.summary());

            let Some(revision) = evaluation.scored(iteration) else {
                let feedback = format!("revision contained no code: {}", evaluation.issues.join("; "));
                steps.push(step.with_feedback(feedback));
                continue;
            };
            let revision = match tools.resolver {
                Some(resolver) if !revision.incomplete.is_empty() => {
                    let (resolved, resolution_step) =
                        complete_revision(tools, resolver, request, iteration, attempts, revision).await;
                    steps.push(resolution_step);
                    resolved
                }
                _ => revision,
            };

            let (new_verdict, new_outcome) = tools.verifier.verify(&revision.candidate).await;
            let passed = new_verdict.is_passed();
            let step = step
                .with_candidate(revision.candidate.clone())
                .with_execution(new_verdict.clone(), new_outcome.clone());

            if passed {
                tracing::info!(iteration, attempt = attempts, score = revision.score, "auto-fix succeeded");
                steps.push(step.with_feedback("execution passed"));
                return FixReport {
                    steps,
                    attempts,
                    fixed: Some(revision),
                    last_verdict: new_verdict,
                };
            }

            let new_error = failure_text(&new_verdict, new_outcome.as_ref());
            steps.push(step.with_feedback(new_error.clone()));
            if !new_verdict.is_fixable() {
                current_verdict = new_verdict;
                break;
            }
            previous_errors.push(std::mem::replace(&mut current_error, new_error));
            current = revision;
            current_verdict = new_verdict;
        }

        tracing::warn!(iteration, attempts, "auto-fix exhausted without a passing revision");
        FixReport {
            steps,
            attempts,
            fixed: None,
            last_verdict: current_verdict,
        }
    }
}

/// 修订版中的桩函数补全一次；合并后重新打分不低于原分数才采用
async fn complete_revision(
    tools: &FixTools<'_>,
    resolver: &IncompleteFunctionResolver,
    request: &str,
    iteration: usize,
    attempt: u32,
    revision: ScoredCandidate,
) -> (ScoredCandidate, GenerationStep) {
    let resolution = resolver
        .resolve(tools.backend, tools.composer, request, &revision.candidate, &revision.incomplete)
        .await;
    let mut step = GenerationStep::new(StepType::Resolution, iteration)
        .with_attempt(attempt)
        .with_prompt(resolution.prompt.clone());
    if let Some(raw) = &resolution.raw_response {
        step = step.with_raw_response(raw.clone());
    }
    if let Some(e) = &resolution.error {
        return (revision, step.with_feedback(format!("backend error: {}", e)));
    }

    let remaining: Vec<String> = resolution.still_incomplete.iter().map(|f| f.name.clone()).collect();
    let step = step.with_candidate(resolution.candidate.clone());
    if resolution.merged.is_empty() {
        return (revision, step.with_feedback(format!("nothing merged; still incomplete [{}]", remaining.join(", "))));
    }
    let rescored = tools
        .evaluator
        .rescore(&resolution.candidate, &resolution.still_incomplete, true, iteration);
    let accepted = rescored.score >= revision.score;
    tracing::info!(
        iteration,
        attempt,
        before = revision.score,
        after = rescored.score,
        accepted,
        "revision stubs resolved"
    );
    let feedback = format!(
        "merged [{}]; still incomplete [{}]; {}",
        resolution.merged.join(", "),
        remaining.join(", "),
        if accepted { "accepted" } else { "not applied" }
    );
    let step = step.with_feedback(feedback);
    if accepted {
        (rescored, step)
    } else {
        (revision, step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SandboxError;
    use crate::generation::sandbox::ExecutionSandbox;
    use crate::generation::types::{Candidate, ErrorDetail};
    use crate::llm::{GenerationParams, MockLlmClient};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// 代码里含有 `raise` 就以 RuntimeError 失败
    struct RaiseSandbox;

    #[async_trait]
    impl ExecutionSandbox for RaiseSandbox {
        async fn run(&self, candidate: &Candidate, _t: Duration) -> Result<ExecutionOutcome, SandboxError> {
            let fails = candidate.files().any(|(_, s)| s.contains("raise"));
            Ok(ExecutionOutcome {
                exit_code: if fails { 1 } else { 0 },
                stdout: String::new(),
                stderr: if fails {
                    "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nRuntimeError: boom\n".into()
                } else {
                    String::new()
                },
                duration: Duration::from_millis(1),
                timed_out: false,
            })
        }
    }

    fn failing() -> (ScoredCandidate, Verdict) {
        let scored = ScoredCandidate {
            candidate: Candidate::single("main.py", "raise RuntimeError('boom')\n"),
            score: 100.0,
            explanation: String::new(),
            violations: Vec::new(),
            iteration_index: 0,
            incomplete: Vec::new(),
        };
        let verdict = Verdict::Failed {
            error: ErrorDetail {
                kind: "RuntimeError".into(),
                message: "boom".into(),
                file: Some("main.py".into()),
                line: Some(1),
            },
        };
        (scored, verdict)
    }

    async fn run_with(script: Vec<&str>, max_attempts: u32) -> (FixReport, Arc<MockLlmClient>) {
        run_with_resolver(script, max_attempts, false).await
    }

    async fn run_with_resolver(
        script: Vec<&str>,
        max_attempts: u32,
        resolve: bool,
    ) -> (FixReport, Arc<MockLlmClient>) {
        let mock = Arc::new(MockLlmClient::scripted(
            script.into_iter().map(|s| Ok(s.to_string())).collect(),
        ));
        let backend = ModelBackend::new(mock.clone(), GenerationParams::default(), Duration::from_secs(5));
        let composer = PromptComposer::default();
        let evaluator = Evaluator::default();
        let verifier = ExecutionVerifier::new(Arc::new(RaiseSandbox), Duration::from_secs(1));
        let resolver = IncompleteFunctionResolver::new(evaluator.extractor().clone());
        let tools = FixTools {
            backend: &backend,
            composer: &composer,
            evaluator: &evaluator,
            verifier: &verifier,
            resolver: resolve.then_some(&resolver),
        };
        let (scored, verdict) = failing();
        let report = AutoFixLoop::new(max_attempts)
            .run(&tools, "task", 0, &scored, &verdict, None)
            .await;
        (report, mock)
    }

    #[tokio::test]
    async fn test_stops_on_first_success() {
        let (report, mock) = run_with(
            vec![
                "```python\nraise RuntimeError('again')\n```",
                "```python\nprint('ok')\n```",
                "```python\nprint('never requested')\n```",
            ],
            3,
        )
        .await;
        assert!(report.is_fixed());
        assert_eq!(report.attempts, 2);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(report.last_verdict, Verdict::Passed);
        let second_prompt = &mock.prompts()[1];
        assert!(second_prompt.contains("raise RuntimeError('again')"));
        assert!(second_prompt.contains("Earlier fix attempts also failed"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let revision = "```python\nraise RuntimeError('still')\n```";
        let (report, mock) = run_with(vec![revision, revision, revision, revision], 3).await;
        assert!(!report.is_fixed());
        assert_eq!(report.attempts, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(report.steps.len(), 3);
        assert!(report
            .steps
            .iter()
            .all(|s| s.step_type == StepType::AutoFix && s.execution.is_some()));
        assert_eq!(
            report.steps.iter().map(|s| s.attempt).collect::<Vec<_>>(),
            vec![Some(1), Some(2), Some(3)]
        );
        assert!(matches!(report.last_verdict, Verdict::Failed { .. }));
    }

    #[tokio::test]
    async fn test_revision_without_code_consumes_attempt() {
        let (report, _) = run_with(
            vec!["Let me think about this problem...", "```python\nprint('ok')\n```"],
            3,
        )
        .await;
        assert!(report.is_fixed());
        assert_eq!(report.attempts, 2);
        assert!(report.steps[0].execution.is_none());
    }

    #[tokio::test]
    async fn test_revision_stubs_are_completed_before_verifying() {
        let (report, mock) = run_with_resolver(
            vec![
                "```python\ndef f():\n    pass\n\n\nprint(f())\n```",
                "```python\ndef f():\n    return 1\n```",
            ],
            3,
            true,
        )
        .await;
        assert_eq!(mock.call_count(), 2);
        assert!(mock.prompts()[1].contains("`f`"));
        let kinds: Vec<StepType> = report.steps.iter().map(|s| s.step_type).collect();
        assert_eq!(kinds, vec![StepType::Resolution, StepType::AutoFix]);

        let fixed = report.fixed.unwrap();
        assert!(fixed.incomplete.is_empty());
        assert!(fixed.candidate.get("main.py").unwrap().contains("return 1"));
        assert_eq!(report.steps[1].candidate_snapshot.as_ref(), Some(&fixed.candidate));
    }

    #[tokio::test]
    async fn test_revision_stubs_kept_when_resolution_disabled() {
        let (report, mock) = run_with(vec!["```python\ndef f():\n    pass\n\n\nprint(f())\n```"], 3).await;
        assert_eq!(mock.call_count(), 1);
        assert_eq!(report.fixed.unwrap().incomplete.len(), 1);
    }
}
