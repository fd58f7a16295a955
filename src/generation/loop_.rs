//! 迭代控制器
//!
//! 每轮：收集上下文 → 构造 prompt → 调用模型 → 提取/修复/分析/打分 →
//! （产生新的最佳候选时）补全桩函数 → 执行校验 → 自动修复。
//! 达到质量阈值即收敛退出，否则用完迭代预算。唯一持有并修改 SessionState 的组件。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{
    BestCandidate, GenerationStep, RecoveryAction, RecoveryEngine, RunError, SessionDelta,
    SessionSnapshot, SessionState, SessionStore, StepError, StepType,
};
use crate::generation::analyzer::{HeuristicAnalyzer, StaticAnalyzer};
use crate::generation::autofix::{AutoFixLoop, FixTools};
use crate::generation::backend::ModelBackend;
use crate::generation::context::{gather_context, ContextSource};
use crate::generation::engine::{GenerationConfig, GenerationEngine};
use crate::generation::evaluate::Evaluator;
use crate::generation::executor::{verdict_error, ExecutionVerifier};
use crate::generation::extractor::ResponseExtractor;
use crate::generation::incomplete::IncompleteFunctionResolver;
use crate::generation::prompt::PromptComposer;
use crate::generation::sandbox::{ExecutionSandbox, ProcessSandbox};
use crate::generation::types::{Candidate, IncompleteFunction, Termination, Verdict};
use crate::llm::{GenerationParams, LlmClient};

/// 一次请求的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub session_id: String,
    pub termination: Termination,
    pub iterations: usize,
    pub best: BestCandidate,
    /// 最佳候选中仍未实现的函数
    pub still_incomplete: Vec<IncompleteFunction>,
    pub history: Vec<GenerationStep>,
}

impl GenerationReport {
    pub fn candidate(&self) -> &Candidate {
        &self.best.scored.candidate
    }

    pub fn score(&self) -> f64 {
        self.best.score()
    }

    pub fn execution_successful(&self) -> Option<bool> {
        self.best.execution_successful
    }

    pub fn execution_fixed(&self) -> bool {
        self.best.execution_fixed
    }
}

pub struct GenerationLoop {
    engine: GenerationEngine,
    backend: ModelBackend,
    composer: PromptComposer,
    evaluator: Evaluator,
    resolver: IncompleteFunctionResolver,
    verifier: ExecutionVerifier,
    autofix: AutoFixLoop,
    recovery: RecoveryEngine,
    context_sources: Vec<Arc<dyn ContextSource>>,
    store: Option<SessionStore>,
    cancel: CancellationToken,
    state: SessionState,
    history: Vec<GenerationStep>,
    best: Option<BestCandidate>,
}

impl GenerationLoop {
    pub fn new(request: impl Into<String>, client: Arc<dyn LlmClient>, config: GenerationConfig) -> Self {
        Self::with_state(SessionState::new(request), Vec::new(), None, client, config)
    }

    /// 从检查点继续；快照按值移入新的控制器
    pub fn resume(snapshot: SessionSnapshot, client: Arc<dyn LlmClient>, config: GenerationConfig) -> Self {
        tracing::info!(
            session_id = %snapshot.state.session_id,
            iteration = snapshot.state.current_iteration,
            complete = snapshot.state.is_complete,
            "resuming session"
        );
        Self::with_state(snapshot.state, snapshot.history, snapshot.best, client, config)
    }

    fn with_state(
        state: SessionState,
        history: Vec<GenerationStep>,
        best: Option<BestCandidate>,
        client: Arc<dyn LlmClient>,
        config: GenerationConfig,
    ) -> Self {
        let extractor = ResponseExtractor::new(config.sandbox.entry_file.clone());
        let backend = ModelBackend::new(client, GenerationParams::default(), config.backend_timeout)
            .with_stream(config.stream);
        let sandbox: Arc<dyn ExecutionSandbox> = Arc::new(ProcessSandbox::new(config.sandbox.clone()));
        Self {
            backend,
            composer: PromptComposer::new(config.max_prompt_violations),
            evaluator: Evaluator::new(extractor.clone(), Arc::new(HeuristicAnalyzer::new())),
            resolver: IncompleteFunctionResolver::new(extractor),
            verifier: ExecutionVerifier::new(sandbox, config.execution_timeout),
            autofix: AutoFixLoop::new(config.max_fix_attempts),
            recovery: RecoveryEngine::new(),
            context_sources: Vec::new(),
            store: None,
            cancel: CancellationToken::new(),
            engine: GenerationEngine::new(config),
            state,
            history,
            best,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.backend = self.backend.with_params(params);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ExecutionSandbox>) -> Self {
        self.verifier = ExecutionVerifier::new(sandbox, self.engine.config().execution_timeout);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn StaticAnalyzer>) -> Self {
        self.evaluator = Evaluator::new(self.evaluator.extractor().clone(), analyzer);
        self
    }

    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_sources.push(source);
        self
    }

    pub fn with_context_sources(mut self, sources: Vec<Arc<dyn ContextSource>>) -> Self {
        self.context_sources.extend(sources);
        self
    }

    /// 设置检查点存储；结束时总会写一次，checkpoint_every_iteration 时每轮都写
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// 取消后当前轮被丢弃（进行中的请求与子进程随之释放），会话保持可恢复
    ///
    /// current_iteration 不前进，恢复时从头重跑被取消的那一轮。该轮在取消前已写入的步骤会保留，
    /// 因此历史中可能出现同一 iteration 编号的两组步骤，以时间戳区分。
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &[GenerationStep] {
        &self.history
    }

    pub fn best(&self) -> Option<&BestCandidate> {
        self.best.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            history: self.history.clone(),
            best: self.best.clone(),
        }
    }

    pub async fn run(&mut self) -> Result<GenerationReport, RunError> {
        if self.state.is_complete {
            tracing::info!(session_id = %self.state.session_id, "session already complete");
            return self.report();
        }

        while self.engine.can_continue(self.state.current_iteration)
            && !self.engine.is_converged(self.best.as_ref())
        {
            let iteration = self.state.current_iteration;
            self.state.apply(SessionDelta::IterationStarted(iteration));
            tracing::info!(iteration, "iteration started");

            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(iteration, "cancelled, saving checkpoint");
                    self.checkpoint();
                    return Err(RunError::Cancelled(iteration));
                }
                result = self.run_iteration(iteration) => result?,
            }

            self.state.apply(SessionDelta::IterationFinished);
            tracing::info!(
                iteration,
                best_score = self.best.as_ref().map(|b| b.score()).unwrap_or(0.0),
                "iteration done"
            );
            if self.engine.config().checkpoint_every_iteration {
                self.checkpoint();
            }
        }

        self.state.apply(SessionDelta::Completed);
        self.checkpoint();
        self.report()
    }

    fn report(&self) -> Result<GenerationReport, RunError> {
        let iterations = self.state.current_iteration;
        let best = match &self.best {
            Some(best) if best.score() > 0.0 => best.clone(),
            _ => {
                let issues = collect_issues(&self.history);
                tracing::warn!(iterations, issues = issues.len(), "no valid candidate");
                return Err(RunError::NoValidCandidate { iterations, issues });
            }
        };
        let termination = if self.engine.is_converged(Some(&best)) {
            Termination::Converged
        } else {
            Termination::Exhausted
        };
        tracing::info!(
            iterations,
            score = best.score(),
            termination = ?termination,
            execution_successful = ?best.execution_successful,
            "generation finished"
        );
        Ok(GenerationReport {
            session_id: self.state.session_id.clone(),
            termination,
            iterations,
            still_incomplete: best.scored.incomplete.clone(),
            best,
            history: self.history.clone(),
        })
    }

    fn checkpoint(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.snapshot()) {
                tracing::warn!(path = %store.path().display(), error = %e, "checkpoint failed");
            }
        }
    }

    /// 记录可恢复错误，并按恢复动作更新 last_error
    fn record_error(&mut self, err: &StepError, first_call: bool) -> RecoveryAction {
        let action = self.recovery.handle(err, first_call);
        tracing::warn!(kind = err.kind(), error = %err, action = ?action, "step failed");
        if let RecoveryAction::RetryWithPrompt(hint) = &action {
            self.state.apply(SessionDelta::ErrorRecorded(Some(hint.clone())));
        }
        action
    }

    async fn run_iteration(&mut self, iteration: usize) -> Result<(), RunError> {
        let request = self.state.request.clone();
        let context = gather_context(&self.context_sources, &request).await;
        let prompt = self.composer.compose(
            iteration,
            &request,
            &context,
            self.best.as_ref().map(|b| &b.scored),
            self.state.last_error.as_deref(),
        );

        let first_call = self.history.is_empty();
        let raw = match self.backend.generate(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                self.history.push(
                    GenerationStep::new(StepType::BackendError, iteration)
                        .with_prompt(prompt)
                        .with_feedback(e.to_string()),
                );
                let err = StepError::BackendError(e.clone());
                if self.record_error(&err, first_call) == RecoveryAction::Abort {
                    return Err(RunError::BackendUnreachable(e.to_string()));
                }
                return Ok(());
            }
        };
        tracing::debug!(iteration, raw_len = raw.len(), "raw response received");

        let evaluation = self.evaluator.evaluate(&raw, Some(prompt.as_str()));
        let mut step = GenerationStep::new(StepType::Generation, iteration)
            .with_prompt(prompt)
            .with_raw_response(raw)
            .with_validation(evaluation.summary())
            .with_feedback(evaluation.explanation.clone());
        if let Some(candidate) = &evaluation.candidate {
            step = step.with_candidate(candidate.clone());
        }
        self.history.push(step);
        tracing::info!(
            iteration,
            classified_as = ?evaluation.classified_as,
            syntax = ?evaluation.syntax,
            score = evaluation.score,
            "candidate scored"
        );

        match &evaluation.error {
            Some(err) => {
                self.record_error(err, false);
            }
            None => self.state.apply(SessionDelta::ErrorRecorded(None)),
        }

        let Some(scored) = evaluation.scored(iteration) else {
            return Ok(());
        };
        if !self.engine.is_improvement(self.best.as_ref(), scored.score) {
            tracing::info!(iteration, score = scored.score, "candidate not better than best");
            return Ok(());
        }
        tracing::info!(iteration, score = scored.score, "best candidate updated");
        self.state.apply(SessionDelta::FilesReplaced(scored.candidate.clone()));
        self.best = Some(BestCandidate::new(scored));

        if self.engine.config().resolve_incomplete {
            self.resolve_incomplete(iteration, &request).await;
        }
        if self.engine.config().verify_execution {
            self.verify_and_fix(iteration, &request).await;
        }
        Ok(())
    }

    async fn resolve_incomplete(&mut self, iteration: usize, request: &str) {
        let Some(best) = self.best.as_ref() else {
            return;
        };
        let stubs = best.scored.incomplete.clone();
        if stubs.is_empty() {
            return;
        }
        let before = best.score();
        let candidate = best.scored.candidate.clone();
        tracing::info!(iteration, stubs = stubs.len(), "resolving incomplete functions");

        let resolution = self
            .resolver
            .resolve(&self.backend, &self.composer, request, &candidate, &stubs)
            .await;

        let mut step = GenerationStep::new(StepType::Resolution, iteration).with_prompt(resolution.prompt.clone());
        if let Some(raw) = &resolution.raw_response {
            step = step.with_raw_response(raw.clone());
        }
        if let Some(e) = &resolution.error {
            self.history.push(step.with_feedback(format!("backend error: {}", e)));
            self.record_error(&StepError::BackendError(e.clone()), false);
            return;
        }

        let mut accepted = false;
        if !resolution.merged.is_empty() {
            let rescored =
                self.evaluator
                    .rescore(&resolution.candidate, &resolution.still_incomplete, true, iteration);
            if rescored.score >= before {
                tracing::info!(iteration, before, after = rescored.score, "completion merged into best");
                self.state.apply(SessionDelta::FilesReplaced(rescored.candidate.clone()));
                self.best = Some(BestCandidate::new(rescored));
                accepted = true;
            } else {
                tracing::warn!(iteration, before, after = rescored.score, "completion lowered the score, discarded");
            }
        }

        let remaining: Vec<String> = resolution.still_incomplete.iter().map(|f| f.name.clone()).collect();
        let feedback = format!(
            "merged [{}]; still incomplete [{}]; {}",
            resolution.merged.join(", "),
            remaining.join(", "),
            if accepted { "accepted" } else { "not applied" }
        );
        self.history.push(step.with_candidate(resolution.candidate.clone()).with_feedback(feedback));

        if !remaining.is_empty() {
            self.record_error(&StepError::IncompleteFunctionUnresolved(remaining), false);
        }
    }

    async fn verify_and_fix(&mut self, iteration: usize, request: &str) {
        let Some(best) = self.best.as_ref() else {
            return;
        };
        let candidate = best.scored.candidate.clone();
        let (verdict, outcome) = self.verifier.verify(&candidate).await;
        tracing::info!(iteration, verdict = ?verdict, "execution verified");
        self.history.push(
            GenerationStep::new(StepType::Execution, iteration)
                .with_candidate(candidate)
                .with_execution(verdict.clone(), outcome.clone()),
        );

        if let Some(best) = self.best.as_mut() {
            best.execution_successful = match &verdict {
                Verdict::Passed => Some(true),
                Verdict::SandboxFailure { .. } => None,
                _ => Some(false),
            };
        }
        let Some(err) = verdict_error(&verdict) else {
            return;
        };
        self.record_error(&err, false);
        if !verdict.is_fixable() || !self.engine.should_fix() {
            return;
        }

        let Some(failing) = self.best.as_ref().map(|b| b.scored.clone()) else {
            return;
        };
        let tools = FixTools {
            backend: &self.backend,
            composer: &self.composer,
            evaluator: &self.evaluator,
            verifier: &self.verifier,
            resolver: self
                .engine
                .config()
                .resolve_incomplete
                .then_some(&self.resolver),
        };
        let report = self
            .autofix
            .run(&tools, request, iteration, &failing, &verdict, outcome.as_ref())
            .await;

        self.history.extend(report.steps);
        self.state.apply(SessionDelta::FixAttempt(report.attempts));
        let last_error = verdict_error(&report.last_verdict);
        match report.fixed {
            Some(fixed) => {
                self.state.apply(SessionDelta::FilesReplaced(fixed.candidate.clone()));
                self.state.apply(SessionDelta::ErrorRecorded(None));
                let mut best = BestCandidate::new(fixed);
                best.execution_successful = Some(true);
                best.execution_fixed = true;
                best.fix_attempts = report.attempts;
                self.best = Some(best);
            }
            None => {
                if let Some(best) = self.best.as_mut() {
                    best.fix_attempts = report.attempts;
                }
                if let Some(err) = last_error {
                    self.record_error(&err, false);
                }
            }
        }
    }
}

/// 历史中记录的全部问题，供 NoValidCandidate 使用
fn collect_issues(history: &[GenerationStep]) -> Vec<String> {
    let mut issues = Vec::new();
    for step in history {
        match step.step_type {
            StepType::BackendError => {
                if let Some(feedback) = &step.feedback {
                    issues.push(format!("iteration {}: backend error: {}", step.iteration, feedback));
                }
            }
            StepType::Generation => {
                if let Some(validation) = &step.validation {
                    issues.extend(
                        validation
                            .issues
                            .iter()
                            .map(|i| format!("iteration {}: {}", step.iteration, i)),
                    );
                }
            }
            _ => {}
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    fn config(max_iterations: usize) -> GenerationConfig {
        GenerationConfig {
            max_iterations,
            verify_execution: false,
            ..GenerationConfig::default()
        }
    }

    /// 三条 warning，得分 89.5，低于默认阈值
    fn mediocre(tag: &str) -> String {
        format!(
            "```python\nfrom os import *\n\n\ndef f(x=[]):\n    return eval(x)\n\n\nprint({})\n```",
            tag
        )
    }

    fn scripted(responses: Vec<Result<&str, LlmError>>) -> Arc<MockLlmClient> {
        Arc::new(MockLlmClient::scripted(
            responses.into_iter().map(|r| r.map(str::to_string)).collect(),
        ))
    }

    #[tokio::test]
    async fn test_converges_on_first_clean_candidate() {
        let mock = scripted(vec![Ok("```python\nprint('hello')\n```")]);
        let mut lp = GenerationLoop::new("print hello", mock.clone(), config(5));
        let report = lp.run().await.unwrap();
        assert_eq!(report.termination, Termination::Converged);
        assert_eq!(report.iterations, 1);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(report.candidate().get("main.py"), Some("print('hello')"));
        assert!(lp.state().is_complete);
        assert_eq!(lp.state().current_files, report.best.scored.candidate);
    }

    #[tokio::test]
    async fn test_improvement_prompt_carries_previous_code() {
        let first = mediocre("1");
        let mock = scripted(vec![Ok(first.as_str()), Ok("```python\nprint('fixed')\n```")]);
        let mut lp = GenerationLoop::new("task", mock.clone(), config(3));
        let report = lp.run().await.unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(report.best.scored.iteration_index, 1);
        let second = &mock.prompts()[1];
        assert!(second.contains("Previous attempt"));
        assert!(second.contains("return eval(x)"));
        assert!(second.contains("wildcard import"));
    }

    #[tokio::test]
    async fn test_tie_keeps_earlier_candidate() {
        let (first, second) = (mediocre("1"), mediocre("2"));
        let mock = scripted(vec![Ok(first.as_str()), Ok(second.as_str())]);
        let mut lp = GenerationLoop::new("task", mock, config(2));
        let report = lp.run().await.unwrap();
        assert_eq!(report.termination, Termination::Exhausted);
        assert_eq!(report.best.scored.iteration_index, 0);
        assert_eq!(report.score(), 89.5);
        assert!(report.candidate().get("main.py").unwrap().contains("print(1)"));
    }

    #[tokio::test]
    async fn test_backend_error_consumes_iteration() {
        let mock = scripted(vec![
            Ok("Let me think about this problem..."),
            Err(LlmError::Unreachable("connection refused".into())),
            Ok("```python\nprint('ok')\n```"),
        ]);
        let mut lp = GenerationLoop::new("task", mock, config(3));
        let report = lp.run().await.unwrap();
        assert_eq!(report.iterations, 3);
        let kinds: Vec<StepType> = report.history.iter().map(|s| s.step_type).collect();
        assert_eq!(kinds, vec![StepType::Generation, StepType::BackendError, StepType::Generation]);
    }

    #[tokio::test]
    async fn test_unreachable_on_first_call_aborts() {
        let mock = scripted(vec![Err(LlmError::Unreachable("connection refused".into()))]);
        let mut lp = GenerationLoop::new("task", mock.clone(), config(5));
        let err = lp.run().await.unwrap_err();
        assert!(matches!(err, RunError::BackendUnreachable(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_not_complete() {
        let token = CancellationToken::new();
        token.cancel();
        let mock = scripted(vec![Ok("```python\nprint(1)\n```")]);
        let mut lp = GenerationLoop::new("task", mock, config(3)).with_cancellation(token);
        let err = lp.run().await.unwrap_err();
        assert_eq!(err, RunError::Cancelled(0));
        assert!(!lp.state().is_complete);
    }

    #[test]
    fn test_collect_issues_from_history() {
        let history = vec![
            GenerationStep::new(StepType::BackendError, 0).with_feedback("timeout"),
            GenerationStep::new(StepType::Execution, 1).with_feedback("ignored"),
        ];
        assert_eq!(collect_issues(&history), vec!["iteration 0: backend error: timeout".to_string()]);
    }
}
