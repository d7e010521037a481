//! Turns an MCP-advertised tool into a [`BoxedTool`] the execution engine can
//! call like any other tool, plus the filter DSL used to expose a named
//! subset of the fleet's tools as a "mode".

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::{
    McpCoordinator,
    connection,
};
use crate::message::ToolSpec;
use crate::tool::{
    BoxedTool,
    ToolContext,
    ToolError,
    ToolResult,
};

/// Composable predicate over `(server_id, tool_name)` pairs.
#[derive(Clone)]
pub enum ToolFilter {
    Any,
    Name(String),
    Server(String),
    Pattern(Arc<Regex>),
    And(Box<ToolFilter>, Box<ToolFilter>),
    Or(Box<ToolFilter>, Box<ToolFilter>),
    Not(Box<ToolFilter>),
}

impl ToolFilter {
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Arc::new(Regex::new(pattern)?)))
    }

    pub fn matches(&self, server_id: &str, tool_name: &str) -> bool {
        match self {
            ToolFilter::Any => true,
            ToolFilter::Name(name) => name == tool_name,
            ToolFilter::Server(server) => server == server_id,
            ToolFilter::Pattern(re) => re.is_match(tool_name),
            ToolFilter::And(a, b) => a.matches(server_id, tool_name) && b.matches(server_id, tool_name),
            ToolFilter::Or(a, b) => a.matches(server_id, tool_name) || b.matches(server_id, tool_name),
            ToolFilter::Not(inner) => !inner.matches(server_id, tool_name),
        }
    }

    pub fn and(self, other: ToolFilter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: ToolFilter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// A named, lazily-applied view over the coordinator's current tool set —
/// re-evaluating `filter` against [`McpCoordinator::tools`] each time picks
/// up servers that connect or disconnect after the mode was built.
pub struct ToolMode {
    pub name: String,
    pub filter: ToolFilter,
}

impl ToolMode {
    pub fn new(name: impl Into<String>, filter: ToolFilter) -> Self {
        Self { name: name.into(), filter }
    }

    pub async fn tools<Deps: Send + Sync + 'static>(
        &self,
        coordinator: &McpCoordinator,
        timeout: Option<Duration>,
        max_retries: u32,
    ) -> Vec<BoxedTool<Deps>> {
        coordinator
            .tools(&self.filter)
            .await
            .into_iter()
            .map(|(server_id, spec)| ToolProxy::new(coordinator.clone(), server_id, spec, timeout, max_retries).into_boxed_tool())
            .collect()
    }
}

/// Stateless handle erasing one MCP server's tool into the engine's
/// [`BoxedTool`] shape. Every call is routed back through the coordinator, so
/// a proxy stays valid across reconnects of its underlying server.
pub struct ToolProxy {
    coordinator: McpCoordinator,
    server_id: String,
    definition: ToolSpec,
    timeout: Option<Duration>,
    max_retries: u32,
}

impl ToolProxy {
    pub fn new(coordinator: McpCoordinator, server_id: String, definition: ToolSpec, timeout: Option<Duration>, max_retries: u32) -> Self {
        Self {
            coordinator,
            server_id,
            definition,
            timeout,
            max_retries,
        }
    }

    pub fn into_boxed_tool<Deps: Send + Sync + 'static>(self) -> BoxedTool<Deps> {
        let ToolProxy {
            coordinator,
            server_id,
            definition,
            timeout,
            max_retries,
        } = self;
        let tool_name = definition.name.clone();

        BoxedTool::from_erased(
            definition.name.clone(),
            definition.description.clone(),
            definition.input_schema.clone(),
            max_retries,
            timeout,
            move |ctx: ToolContext<Deps>, raw_args: String| {
                let coordinator = coordinator.clone();
                let server_id = server_id.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move {
                    let args = match parse_args(&raw_args) {
                        Ok(args) => args,
                        Err(e) => return ToolResult::Failure(ToolError::ArgumentParsing(e)),
                    };
                    call_with_retries(&coordinator, &server_id, &tool_name, args, timeout, max_retries, &ctx).await
                })
            },
        )
    }
}

fn parse_args(raw_args: &str) -> Result<Option<serde_json::Map<String, serde_json::Value>>, String> {
    if raw_args.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<serde_json::Value>(raw_args) {
        Ok(serde_json::Value::Null) => Ok(None),
        Ok(serde_json::Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

async fn call_with_retries<Deps>(
    coordinator: &McpCoordinator,
    server_id: &str,
    tool_name: &str,
    args: Option<serde_json::Map<String, serde_json::Value>>,
    timeout: Option<Duration>,
    max_retries: u32,
    ctx: &ToolContext<Deps>,
) -> ToolResult<String> {
    let mut attempt = 0;
    loop {
        let result = coordinator.call_tool(server_id, tool_name, args.clone(), timeout, ctx.cancel_token.clone()).await;
        match result {
            Ok(output) => return ToolResult::Success(output),
            Err(super::CoordinatorError::Cancelled) => return ToolResult::Failure(ToolError::Raised("tool call cancelled".to_string())),
            Err(super::CoordinatorError::UnknownServer(id)) => {
                return ToolResult::Failure(ToolError::ServerDisconnected(format!("server {id:?} is no longer registered")));
            },
            Err(super::CoordinatorError::Connection(connection::ConnectionError::NotConnected)) => {
                return ToolResult::Failure(ToolError::ServerDisconnected(format!("server {server_id:?} is not connected")));
            },
            Err(super::CoordinatorError::Connection(connection::ConnectionError::ServerDisconnected)) => {
                return ToolResult::Failure(ToolError::Raised(format!("server {server_id:?} disconnected mid-call")));
            },
            Err(super::CoordinatorError::ToolTimeout { .. }) => {
                if attempt >= max_retries {
                    return ToolResult::Retry(format!("{tool_name} timed out; try again with simpler input"));
                }
            },
            Err(e) => {
                if attempt >= max_retries {
                    return ToolResult::Failure(ToolError::Raised(e.to_string()));
                }
            },
        }
        attempt += 1;
        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
    }
}
