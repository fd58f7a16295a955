//! codeloop 命令行入口
//!
//! 加载配置、创建模型后端，运行生成循环并以 JSON 输出摘要；`--out` 时把最佳候选写到目录。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use codeloop::{
    config::load_config,
    core::{RunError, SessionStore},
    generation::{check_relative, ContextSource, FileContext, GenerationConfig, GenerationLoop, GenerationReport},
    llm::{create_llm_from_config, GenerationParams},
    observability,
};
use tokio_util::sync::CancellationToken;

/// 单个上下文文件的最大读取字节数
const CONTEXT_MAX_BYTES: usize = 16 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "codeloop",
    about = "Generate, verify and repair code with a language model",
    version
)]
struct Args {
    /// Natural-language description of the program to write
    request: Option<String>,

    /// Extra config file (merged over config/default.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override [generation].max_iterations
    #[arg(short = 'n', long)]
    max_iterations: Option<usize>,

    /// Write the best candidate's files into this directory
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Save the session checkpoint to this file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Resume from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Project files given to the model as context
    #[arg(long = "context")]
    context: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let mut cfg = load_config(args.config.clone()).context("Failed to load config")?;
    if let Some(n) = args.max_iterations {
        cfg.generation.max_iterations = n;
    }

    let client = create_llm_from_config(&cfg.llm).context("Failed to create model backend")?;
    let config = GenerationConfig::from(&cfg);
    let params = GenerationParams::from(&cfg.llm.params);

    let mut generation = match &args.resume {
        Some(path) => {
            let snapshot = SessionStore::new(path)
                .load()?
                .with_context(|| format!("No checkpoint at {}", path.display()))?;
            GenerationLoop::resume(snapshot, client, config)
        }
        None => {
            let request = args
                .request
                .clone()
                .context("A request is required unless --resume is given")?;
            GenerationLoop::new(request, client, config)
        }
    }
    .with_params(params);

    let store = args
        .checkpoint
        .clone()
        .or_else(|| args.resume.clone())
        .map(SessionStore::new)
        .or_else(|| {
            cfg.session
                .checkpoint_dir
                .as_ref()
                .map(|dir| SessionStore::in_dir(dir, &generation.state().session_id))
        });
    if let Some(store) = store {
        tracing::info!(path = %store.path().display(), "checkpointing session");
        generation = generation.with_store(store);
    }

    let sources: Vec<Arc<dyn ContextSource>> = args
        .context
        .iter()
        .map(|p| Arc::new(FileContext::new(p, CONTEXT_MAX_BYTES)) as Arc<dyn ContextSource>)
        .collect();
    generation = generation.with_context_sources(sources);

    let token = CancellationToken::new();
    generation = generation.with_cancellation(token.clone());
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Received Ctrl+C, stopping after saving a checkpoint");
            token.cancel();
        }
    });

    match generation.run().await {
        Ok(report) => {
            if let Some(dir) = &args.out {
                write_candidate(dir, &report)
                    .with_context(|| format!("Failed to write files to {}", dir.display()))?;
            }
            println!("{}", serde_json::to_string_pretty(&summary(&report, args.out.as_deref()))?);
            Ok(())
        }
        Err(e) => {
            let summary = failure_summary(&e, &generation.state().session_id);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Err(e.into())
        }
    }
}

fn write_candidate(dir: &Path, report: &GenerationReport) -> anyhow::Result<()> {
    for (path, source) in report.candidate().files() {
        check_relative(path)?;
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, source)?;
        tracing::info!(path = %target.display(), "file written");
    }
    Ok(())
}

fn summary(report: &GenerationReport, out: Option<&Path>) -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "session_id": report.session_id,
        "termination": report.termination,
        "iterations": report.iterations,
        "score": report.score(),
        "explanation": report.best.scored.explanation,
        "execution_successful": report.execution_successful(),
        "execution_fixed": report.execution_fixed(),
        "fix_attempts": report.best.fix_attempts,
        "still_incomplete": report.still_incomplete.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
        "files": report.candidate().paths().collect::<Vec<_>>(),
        "steps": report.history.len(),
        "out": out.map(|p| p.display().to_string()),
    })
}

fn failure_summary(err: &RunError, session_id: &str) -> serde_json::Value {
    let (kind, issues) = match err {
        RunError::BackendUnreachable(_) => ("backend_unreachable", Vec::new()),
        RunError::NoValidCandidate { issues, .. } => ("no_valid_candidate", issues.clone()),
        RunError::Cancelled(_) => ("cancelled", Vec::new()),
    };
    serde_json::json!({
        "status": "failed",
        "session_id": session_id,
        "error": kind,
        "message": err.to_string(),
        "issues": issues,
    })
}
