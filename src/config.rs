//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CODELOOP__*` 覆盖（双下划线表示嵌套，如 `CODELOOP__LLM__PROVIDER=ollama`）。
//! 配置在启动时构造一次，之后以值或引用传入各组件；运行期间不再读取环境变量。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::GenerationParams;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// 模型后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Mock,
    OpenAi,
    DeepSeek,
    Ollama,
}

/// [llm] 段：后端选择、采样参数与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Timeout / 限流时的重试次数（0 表示不包装重试）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub params: LlmParamsSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            base_url: None,
            api_key: None,
            max_retries: default_max_retries(),
            params: LlmParamsSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_max_retries() -> u32 {
    2
}

/// [llm.params] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LlmParamsSection {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for LlmParamsSection {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            stop: Vec::new(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

impl From<&LlmParamsSection> for GenerationParams {
    fn from(section: &LlmParamsSection) -> Self {
        Self {
            model: None,
            temperature: section.temperature,
            max_tokens: section.max_tokens,
            top_p: section.top_p,
            top_k: section.top_k,
            stop: section.stop.clone(),
        }
    }
}

/// [llm.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    #[serde(default = "default_stream_timeout")]
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            stream: default_stream_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

fn default_stream_timeout() -> u64 {
    300
}

/// [generation] 段：迭代预算、收敛阈值、修复开关
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_true")]
    pub auto_fix: bool,
    #[serde(default = "default_true")]
    pub resolve_incomplete: bool,
    #[serde(default = "default_true")]
    pub verify_execution: bool,
    /// 改进 prompt 中最多列出的违规条数
    #[serde(default = "default_max_prompt_violations")]
    pub max_prompt_violations: usize,
    /// 使用流式接口拼接输出
    #[serde(default)]
    pub stream: bool,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            max_fix_attempts: default_max_fix_attempts(),
            auto_fix: true,
            resolve_incomplete: true,
            verify_execution: true,
            max_prompt_violations: default_max_prompt_violations(),
            stream: false,
        }
    }
}

fn default_max_iterations() -> usize {
    5
}

fn default_quality_threshold() -> f64 {
    90.0
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_max_prompt_violations() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// [sandbox] 段：解释器、入口文件与超时
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 入口文件；候选中不存在时取第一个文件
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    /// stdout / stderr 各自保留的最大字节数
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            args: Vec::new(),
            entry_file: default_entry_file(),
            timeout_secs: default_sandbox_timeout(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_entry_file() -> String {
    "main.py".to_string()
}

fn default_sandbox_timeout() -> u64 {
    10
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

/// [session] 段：检查点目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    pub checkpoint_dir: Option<PathBuf>,
    /// 每轮迭代结束后写一次检查点
    #[serde(default)]
    pub checkpoint_every_iteration: bool,
}

/// 从 config 目录加载配置，环境变量 CODELOOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CODELOOP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CODELOOP")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, Provider::Mock);
        assert_eq!(cfg.generation.max_iterations, 5);
        assert_eq!(cfg.generation.quality_threshold, 90.0);
        assert_eq!(cfg.generation.max_fix_attempts, 3);
        assert_eq!(cfg.generation.max_prompt_violations, 5);
        assert_eq!(cfg.sandbox.timeout_secs, 10);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[llm]
provider = "ollama"
model = "qwen2.5-coder"

[llm.params]
top_k = 20
stop = ["<|end|>"]

[generation]
max_iterations = 2
auto_fix = false

[sandbox]
interpreter = "sh"
entry_file = "main.sh"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.provider, Provider::Ollama);
        assert_eq!(cfg.llm.model, "qwen2.5-coder");
        assert_eq!(cfg.llm.params.top_k, 20);
        assert_eq!(cfg.generation.max_iterations, 2);
        assert!(!cfg.generation.auto_fix);
        assert!(cfg.generation.resolve_incomplete);
        assert_eq!(cfg.sandbox.entry_file, "main.sh");

        let params = GenerationParams::from(&cfg.llm.params);
        assert_eq!(params.stop, vec!["<|end|>".to_string()]);
    }
}
