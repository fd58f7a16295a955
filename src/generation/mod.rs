//! 生成-校验循环
//!
//! 叶子到根：prompt → extractor → repair → analyzer/scorer → incomplete → executor → autofix → loop_。

pub mod analyzer;
pub mod autofix;
pub mod backend;
pub mod context;
pub mod engine;
pub mod evaluate;
pub mod executor;
pub mod extractor;
pub mod incomplete;
pub mod lexer;
pub mod loop_;
pub mod prompt;
pub mod repair;
pub mod sandbox;
pub mod scorer;
pub mod syntax;
pub mod types;

pub use analyzer::{Analysis, HeuristicAnalyzer, StaticAnalyzer};
pub use autofix::{AutoFixLoop, FixReport};
pub use backend::ModelBackend;
pub use context::{gather_context, ContextItem, ContextSource, FileContext, StaticContext};
pub use engine::{GenerationConfig, GenerationEngine};
pub use evaluate::{Evaluation, Evaluator};
pub use executor::{parse_traceback, ExecutionVerifier};
pub use extractor::{normalize_escapes, ResponseExtractor};
pub use incomplete::{IncompleteFunctionResolver, Resolution};
pub use loop_::{GenerationLoop, GenerationReport};
pub use prompt::PromptComposer;
pub use repair::{RepairOutcome, SyntaxRepairer};
pub use sandbox::{check_relative, ExecutionSandbox, ProcessSandbox, SandboxConfig, TIMEOUT_EXIT_CODE};
pub use scorer::{score, Score, ScoreInput};
pub use syntax::{PythonSyntaxChecker, SyntaxChecker};
pub use types::*;
