use std::time::Duration;

use crate::config::AppConfig;
use crate::core::BestCandidate;
use crate::generation::sandbox::SandboxConfig;

/// 生成循环的运行参数，由 AppConfig 各段合成
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_iterations: usize,
    pub quality_threshold: f64,
    pub max_fix_attempts: u32,
    pub auto_fix: bool,
    pub resolve_incomplete: bool,
    pub verify_execution: bool,
    pub max_prompt_violations: usize,
    pub stream: bool,
    /// 单次模型调用的超时
    pub backend_timeout: Duration,
    /// 单次执行校验的超时
    pub execution_timeout: Duration,
    pub sandbox: SandboxConfig,
    pub checkpoint_every_iteration: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GenerationConfig {
    fn from(config: &AppConfig) -> Self {
        let generation = &config.generation;
        let backend_timeout = if generation.stream {
            config.llm.timeouts.stream
        } else {
            config.llm.timeouts.request
        };
        Self {
            max_iterations: generation.max_iterations,
            quality_threshold: generation.quality_threshold,
            max_fix_attempts: generation.max_fix_attempts,
            auto_fix: generation.auto_fix,
            resolve_incomplete: generation.resolve_incomplete,
            verify_execution: generation.verify_execution,
            max_prompt_violations: generation.max_prompt_violations,
            stream: generation.stream,
            backend_timeout: Duration::from_secs(backend_timeout),
            execution_timeout: Duration::from_secs(config.sandbox.timeout_secs),
            sandbox: SandboxConfig::from(&config.sandbox),
            checkpoint_every_iteration: config.session.checkpoint_every_iteration,
        }
    }
}

/// 迭代预算、收敛判定与最佳候选的比较规则
#[derive(Debug, Clone)]
pub struct GenerationEngine {
    config: GenerationConfig,
}

impl GenerationEngine {
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// next_iteration 从 0 开始计数
    pub fn can_continue(&self, next_iteration: usize) -> bool {
        next_iteration < self.config.max_iterations
    }

    pub fn is_converged(&self, best: Option<&BestCandidate>) -> bool {
        best.is_some_and(|b| b.score() >= self.config.quality_threshold)
    }

    /// 严格高于当前最佳才替换；同分保留更早的候选
    pub fn is_improvement(&self, best: Option<&BestCandidate>, score: f64) -> bool {
        match best {
            Some(b) => score > b.score(),
            None => true,
        }
    }

    pub fn should_fix(&self) -> bool {
        self.config.auto_fix && self.config.max_fix_attempts > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::types::{Candidate, ScoredCandidate};

    fn best(score: f64) -> BestCandidate {
        BestCandidate::new(ScoredCandidate {
            candidate: Candidate::single("main.py", "x = 1\n"),
            score,
            explanation: String::new(),
            violations: Vec::new(),
            iteration_index: 0,
            incomplete: Vec::new(),
        })
    }

    #[test]
    fn test_config_from_app_config() {
        let mut app = AppConfig::default();
        app.generation.max_iterations = 2;
        app.generation.stream = true;
        app.sandbox.timeout_secs = 3;
        let config = GenerationConfig::from(&app);
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.backend_timeout, Duration::from_secs(300));
        assert_eq!(config.execution_timeout, Duration::from_secs(3));
        assert_eq!(config.sandbox.interpreter, "python3");
    }

    #[test]
    fn test_budget_and_convergence() {
        let engine = GenerationEngine::new(GenerationConfig::default());
        assert!(engine.can_continue(4));
        assert!(!engine.can_continue(5));
        assert!(!engine.is_converged(None));
        assert!(!engine.is_converged(Some(&best(89.9))));
        assert!(engine.is_converged(Some(&best(90.0))));
    }

    #[test]
    fn test_ties_keep_earlier_candidate() {
        let engine = GenerationEngine::new(GenerationConfig::default());
        assert!(engine.is_improvement(None, 0.0));
        assert!(!engine.is_improvement(Some(&best(70.0)), 70.0));
        assert!(engine.is_improvement(Some(&best(70.0)), 70.5));
    }
}
