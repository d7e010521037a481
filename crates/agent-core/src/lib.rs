//! Drives a bounded, iterative dialogue between a language model and a set of
//! callable tools until the model produces a typed final value or a terminal
//! condition (exhaustion, refusal, deferred approval, cancellation) is
//! reached.
//!
//! The crate is organized bottom-up: [`message`] and [`model`] define the
//! wire contract with a model provider, [`tool`] and [`tool_engine`] define
//! how tool calls are invoked, [`retry`] supplies the policy objects that
//! guard model calls, [`agent`] contains the shared state machine behind
//! `run`/`stream`/`iter`/`resume`, and [`mcp`] implements the coordinator
//! that manages a fleet of Model Context Protocol server connections and
//! exposes their tools as proxies.

pub mod agent;
pub mod mcp;
pub mod message;
pub mod model;
pub mod retry;
pub mod tool;
pub mod tool_engine;

pub use agent::error::AgentError;
pub use agent::state::{
    PausedRun,
    PendingCall,
    Resolution,
    ResolutionFor,
};
pub use agent::{
    Agent,
    AgentConfig,
    AgentEvent,
    IterNode,
};
pub use mcp::{
    Alert,
    ConnectionEvent,
    ConnectionSnapshot,
    ConnectionState,
    CoordinatorConfig,
    CoordinatorError,
    McpCoordinator,
    ReconnectPolicy,
    ServerEvent,
    ServerSpec,
    ToolFilter,
    ToolMode,
    ToolProxy,
};
pub use message::{
    CompletionResponse,
    ContentPart,
    Message,
    StopReason,
    StreamEvent,
    ToolCall,
    ToolSpec,
    Usage,
};
pub use model::{
    CompletionRequest,
    LlmError,
    Model,
    ModelCapabilities,
};
pub use retry::{
    RetryPolicy,
    UsageLimits,
};
pub use tool::{
    Deferral,
    DeferralKind,
    Tool,
    ToolError,
    ToolResult,
};
