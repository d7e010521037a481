//! Run-scoped state: the mutable state machine owned by one active run, and
//! its frozen form on deferral.

use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

use crate::message::{
    Message,
    ToolCall,
    Usage,
};
use crate::tool::Deferral;

/// Exclusively owned by one active run; constructed fresh on `run`/`stream`/
/// `iter`, reconstructed from a [`PausedRun`] on `resume`, and dropped on
/// terminal outcome.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub request_count: u32,
    pub tool_call_count: u32,
    /// Monotonic count of loop iterations taken so far in this run.
    pub step: u32,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            messages: Vec::new(),
            usage: Usage::default(),
            request_count: 0,
            tool_call_count: 0,
            step: 0,
        }
    }

    pub fn from_paused(paused: &PausedRun) -> Self {
        Self {
            run_id: paused.run_id,
            messages: paused.messages.clone(),
            usage: paused.usage,
            request_count: paused.request_count,
            tool_call_count: paused.tool_call_count,
            step: 0,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// A self-contained snapshot of a run that stopped to wait on external
/// resolution of one or more deferred tool calls. The caller is responsible
/// for storage; this type only guarantees the fields below round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedRun {
    pub run_id: Uuid,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub request_count: u32,
    pub tool_call_count: u32,
    pub pending_calls: Vec<PendingCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCall {
    pub tool_call: ToolCall,
    pub deferral: Deferral,
}

/// How the caller resolved a single deferred tool call, supplied to
/// [`crate::agent::Agent::resume`]. The set of ids supplied must be a
/// bijection with `PausedRun::pending_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Resolution {
    Approved,
    Denied { reason: Option<String> },
    Completed { result: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionFor {
    pub id: String,
    pub resolution: Resolution,
}
