//! 核心层：错误与恢复、会话状态、检查点

pub mod error;
pub mod persistence;
pub mod recovery;
pub mod state;

pub use error::{RecoveryAction, RunError, SandboxError, StepError};
pub use persistence::SessionStore;
pub use recovery::RecoveryEngine;
pub use state::{
    BestCandidate, ExecutionRecord, GenerationStep, SessionDelta, SessionSnapshot, SessionState,
    StepType,
};
