use std::time::Duration;

use crate::agent::state::PausedRun;
use crate::model::LlmError;
use crate::retry::UsageLimitKind;

/// The error taxonomy surfaced to the caller of `run`/`resume`. `stream`/
/// `iter` surface the same kinds as a terminal event rather than an `Err`,
/// since those modes must keep producing events up to the point of failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("usage limit exceeded: {kind} used {used}, limit {limit}")]
    UsageLimitExceeded { kind: UsageLimitKind, used: u64, limit: u64 },
    #[error("reached the maximum of {0} iterations without converging")]
    MaxIterationsReached(u32),
    #[error("unexpected model behavior: {0}")]
    UnexpectedModelBehavior(String),
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: LlmError },
    #[error("tool {name:?} exceeded its {timeout:?} timeout")]
    ToolTimeout { name: String, timeout: Duration },
    #[error("{} tool call(s) require external resolution", .0.pending_calls.len())]
    HasDeferredTools(Box<PausedRun>),
    #[error("the run was cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<crate::tool_engine::ToolEngineError> for AgentError {
    fn from(value: crate::tool_engine::ToolEngineError) -> Self {
        match value {
            crate::tool_engine::ToolEngineError::Timeout { name, timeout } => AgentError::ToolTimeout { name, timeout },
            crate::tool_engine::ToolEngineError::Cancelled => AgentError::Cancelled,
        }
    }
}
