//! Typed tool contract and its type-erased form. A typed [`Tool`] is wrapped
//! at registration time into a [`BoxedTool`], an erased handle whose call
//! function takes raw JSON and returns a raw JSON (well, string) result —
//! the engine never round-trips an arbitrary typed output through itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use tokio_util::sync::CancellationToken;

/// Context passed to every tool invocation: the user-supplied `deps` (shared
/// by read reference across concurrent invocations) plus the cancellation
/// handle for this specific call.
#[derive(Clone)]
pub struct ToolContext<Deps> {
    pub deps: Arc<Deps>,
    pub cancel_token: CancellationToken,
    pub retries: u32,
}

/// What a tool invocation produced.
#[derive(Debug, Clone)]
pub enum ToolResult<T> {
    Success(T),
    /// Ask the model to try again with different arguments; `feedback` is
    /// surfaced to the model verbatim.
    Retry(String),
    Failure(ToolError),
    Deferred(Deferral),
}

impl<T> ToolResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ToolResult<U> {
        match self {
            ToolResult::Success(v) => ToolResult::Success(f(v)),
            ToolResult::Retry(fb) => ToolResult::Retry(fb),
            ToolResult::Failure(e) => ToolResult::Failure(e),
            ToolResult::Deferred(d) => ToolResult::Deferred(d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferralKind {
    Approval,
    External,
}

/// Returned instead of a result when a tool needs control handed back to the
/// host: human approval, or waiting on some external completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deferral {
    pub kind: DeferralKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum ToolError {
    #[error("no tool registered with name {0:?}")]
    ToolNotFound(String),
    #[error("failed to parse tool arguments: {0}")]
    ArgumentParsing(String),
    #[error("failed to serialize tool output: {0}")]
    OutputSerialization(String),
    #[error("tool raised an error: {0}")]
    Raised(String),
    #[error("mcp server disconnected: {0}")]
    ServerDisconnected(String),
}

/// A strongly typed tool. Implementations describe their schema once;
/// [`erase`] wraps them into the type-erased handle the engine actually
/// stores.
#[async_trait::async_trait]
pub trait Tool<Deps, Args, Output>: Send + Sync + 'static
where
    Args: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
{
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value>;

    fn max_retries(&self) -> u32 {
        1
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn call(&self, ctx: &ToolContext<Deps>, args: Args) -> ToolResult<Output>;
}

type ErasedCall<Deps> = Box<
    dyn Fn(ToolContext<Deps>, String) -> Pin<Box<dyn Future<Output = ToolResult<String>> + Send>> + Send + Sync,
>;

/// The type-erased form every tool is stored as once registered with an
/// agent: definition plus a boxed `(context, raw_json) -> ToolResult<string>`
/// closure.
pub struct BoxedTool<Deps> {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Map<String, serde_json::Value>,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    call: ErasedCall<Deps>,
}

impl<Deps> std::fmt::Debug for BoxedTool<Deps> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedTool").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<Deps: Send + Sync + 'static> BoxedTool<Deps> {
    pub fn new<A, O, T>(tool: T) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        T: Tool<Deps, A, O>,
    {
        let tool = Arc::new(tool);
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
            max_retries: tool.max_retries(),
            timeout: tool.timeout(),
            call: Box::new(move |ctx, raw_args| {
                let tool = Arc::clone(&tool);
                Box::pin(async move {
                    let args: A = match serde_json::from_str(&raw_args) {
                        Ok(a) => a,
                        Err(e) => return ToolResult::Failure(ToolError::ArgumentParsing(e.to_string())),
                    };
                    match tool.call(&ctx, args).await {
                        ToolResult::Success(output) => match serde_json::to_string(&output) {
                            Ok(s) => ToolResult::Success(s),
                            Err(e) => ToolResult::Failure(ToolError::OutputSerialization(e.to_string())),
                        },
                        ToolResult::Retry(fb) => ToolResult::Retry(fb),
                        ToolResult::Failure(e) => ToolResult::Failure(e),
                        ToolResult::Deferred(d) => ToolResult::Deferred(d),
                    }
                })
            }),
        }
    }

    pub async fn invoke(&self, ctx: ToolContext<Deps>, raw_args: String) -> ToolResult<String> {
        (self.call)(ctx, raw_args).await
    }

    /// Builds a tool directly from its erased form, bypassing the typed
    /// [`Tool`] trait. Used by [`crate::mcp::proxy::ToolProxy`], which
    /// already speaks raw JSON on both sides and has no typed `Args`/`Output`
    /// to erase.
    pub fn from_erased(
        name: String,
        description: String,
        input_schema: serde_json::Map<String, serde_json::Value>,
        max_retries: u32,
        timeout: Option<Duration>,
        call: impl Fn(ToolContext<Deps>, String) -> Pin<Box<dyn Future<Output = ToolResult<String>> + Send>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            description,
            input_schema,
            max_retries,
            timeout,
            call: Box::new(call),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    struct EchoArgs {
        value: String,
    }
    impl<'de> Deserialize<'de> for EchoArgs {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            #[derive(Deserialize)]
            struct Raw {
                value: String,
            }
            Raw::deserialize(deserializer).map(|r| EchoArgs { value: r.value })
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool<(), EchoArgs, String> for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its input"
        }

        fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
            serde_json::Map::new()
        }

        async fn call(&self, _ctx: &ToolContext<()>, args: EchoArgs) -> ToolResult<String> {
            ToolResult::Success(args.value)
        }
    }

    #[tokio::test]
    async fn erased_tool_round_trips_json() {
        let boxed = BoxedTool::new(EchoTool);
        let ctx = ToolContext {
            deps: Arc::new(()),
            cancel_token: CancellationToken::new(),
            retries: 0,
        };
        let result = boxed.invoke(ctx, r#"{"value":"hi"}"#.to_string()).await;
        match result {
            ToolResult::Success(s) => assert_eq!(s, "\"hi\""),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_arguments_become_failure() {
        let boxed = BoxedTool::new(EchoTool);
        let ctx = ToolContext {
            deps: Arc::new(()),
            cancel_token: CancellationToken::new(),
            retries: 0,
        };
        let result = boxed.invoke(ctx, "not json".to_string()).await;
        assert!(matches!(result, ToolResult::Failure(ToolError::ArgumentParsing(_))));
    }
}
