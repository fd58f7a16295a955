//! codeloop - 由模型驱动的代码生成与校验循环
//!
//! 把一条自然语言需求反复交给模型，在迭代与修复预算内提取、修复、打分、补全、执行并自动修复，
//! 最终给出得分最高的候选和完整的审计历史。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话状态、检查点
//! - **generation**: 提取、语法修复、静态分析、打分、桩函数补全、执行校验、自动修复、迭代控制
//! - **llm**: 模型后端抽象与实现（OpenAI 兼容 / DeepSeek / Ollama / Mock）
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod generation;
pub mod llm;
pub mod observability;

pub use generation::{GenerationConfig, GenerationLoop, GenerationReport};
