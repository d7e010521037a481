//! Wire-adjacent types shared across the MCP module: tool/prompt conversions
//! from `rmcp`'s model, connection state, and the event/alert vocabularies
//! published by a connection and the coordinator.

use std::time::Duration;

use rmcp::model::{
    Prompt as RmcpPrompt,
    PromptArgument as RmcpPromptArgument,
    Tool as RmcpTool,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::message::ToolSpec;

impl From<RmcpTool> for ToolSpec {
    fn from(value: RmcpTool) -> Self {
        Self {
            name: value.name.to_string(),
            description: value.description.map(String::from).unwrap_or_default(),
            input_schema: (*value.input_schema).clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl From<RmcpPrompt> for Prompt {
    fn from(value: RmcpPrompt) -> Self {
        Self {
            name: value.name,
            description: value.description,
            arguments: value.arguments.map(|v| v.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<RmcpPromptArgument> for PromptArgument {
    fn from(value: RmcpPromptArgument) -> Self {
        Self {
            name: value.name,
            description: value.description,
            required: value.required,
        }
    }
}

/// How to reach an MCP server. Each variant names the live-client factory
/// that owns its transport specifics; `Http`/`OAuth` are this crate's own
/// addition — the corpus this module is grounded on only implements `Stdio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: Option<std::collections::HashMap<String, String>>,
    },
    Http {
        url: String,
    },
    OAuth {
        url: String,
        redirect_scheme: String,
    },
}

impl ServerSpec {
    pub fn describe(&self) -> String {
        match self {
            ServerSpec::Stdio { command, .. } => format!("stdio:{command}"),
            ServerSpec::Http { url } => format!("http:{url}"),
            ServerSpec::OAuth { url, .. } => format!("oauth:{url}"),
        }
    }
}

/// A connection's place in its state machine. See module docs on
/// [`crate::mcp::connection`] for the transition rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Failed { retry_count: u32 },
    Reconnecting { retry_count: u32, max_attempts: Option<u32>, retry_in: Duration },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Published by a single connection: `StateChanged` on every transition,
/// `Log` entries from the server's own logging notifications (bounded by the
/// connection to the last 1000), and a start/complete/cancel triple around
/// every tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    StateChanged { from: ConnectionState, to: ConnectionState },
    Log(LogEntry),
    ToolCallStarted { request_id: u64, tool_name: String },
    ToolCallCompleted { request_id: u64, tool_name: String, duration: Duration },
    ToolCallCancelled { request_id: u64, tool_name: String },
}

/// A coordinator-level event: a connection's own event plus which server it
/// came from, re-emitted on the coordinator's `events` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub server_id: String,
    pub event: ConnectionEvent,
}

/// Coordinator-synthesised notifications intended for human-facing UIs —
/// distinct from `ServerEvent` because alerts summarise policy decisions
/// (retrying, giving up) rather than raw connection activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Alert {
    ConnectionFailed { server_id: String },
    ConnectionLost { server_id: String },
    Reconnecting { server_id: String, attempt: u32, max_attempts: Option<u32> },
    Reconnected { server_id: String },
    ToolTimedOut { server: String, tool: String },
    ServerUnhealthy { server_id: String, reason: String },
}

/// Progress updates for an OAuth connection waiting on the host's callback
/// router. This crate never performs the callback UX itself — see
/// [`crate::mcp::transport::OAuthCallbackRouter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthProgress {
    AwaitingRedirect { authorize_url: String },
    Exchanging,
    Complete,
    Failed { reason: String },
}

/// Returned by [`crate::mcp::McpCoordinator::snapshot`]: a point-in-time view
/// of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub server_id: String,
    pub state: ConnectionState,
    pub tools: Vec<ToolSpec>,
}
