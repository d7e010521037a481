//! Runs a batch of [`ToolCall`]s against a registered tool set, honouring
//! per-call retry, per-call timeout, cancellation, and deferral semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use crate::message::ToolCall;
use crate::tool::{
    BoxedTool,
    Deferral,
    ToolContext,
    ToolError,
    ToolResult,
};

/// Thrown by the engine itself rather than returned as a [`ToolResult`] —
/// these are not choices the model gets to see, they end the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolEngineError {
    #[error("tool {name:?} exceeded its {timeout:?} timeout")]
    Timeout { name: String, timeout: Duration },
    #[error("cancelled")]
    Cancelled,
}

/// The outcome of one call within a batch.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub call: ToolCall,
    pub result: ToolResult<String>,
    pub duration: Duration,
}

/// The outcome of running an entire batch of tool calls.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<CallOutcome>,
    pub stopped_on_deferral: bool,
    pub deferred_calls: Vec<(ToolCall, Deferral)>,
}

/// Optional callbacks invoked around each call, so the agent loop can emit
/// stream events or iteration nodes without duplicating batch logic.
pub trait ToolEngineObserver: Send + Sync {
    fn on_start(&self, _call: &ToolCall) {}
    fn on_complete(&self, _call: &ToolCall, _result: &ToolResult<String>, _duration: Duration) {}
}

pub struct NoopObserver;
impl ToolEngineObserver for NoopObserver {}

pub struct ToolExecutionEngine<Deps> {
    tools: HashMap<String, BoxedTool<Deps>>,
}

impl<Deps: Send + Sync + 'static> ToolExecutionEngine<Deps> {
    pub fn new(tools: Vec<BoxedTool<Deps>>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&BoxedTool<Deps>> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &BoxedTool<Deps>> {
        self.tools.values()
    }

    /// Executes `call` alone, applying retry and timeout per the tool's own
    /// configuration. Returns `Err` only for conditions the engine itself
    /// must surface as an agent-fatal error (timeout, cancellation) — every
    /// other outcome, including an unknown tool name, comes back as a
    /// [`ToolResult`] so the model can see it.
    pub async fn run_single(
        &self,
        deps: Arc<Deps>,
        call: &ToolCall,
        cancel_token: CancellationToken,
    ) -> Result<ToolResult<String>, ToolEngineError> {
        let Some(tool) = self.tools.get(&call.name) else {
            return Ok(ToolResult::Failure(ToolError::ToolNotFound(call.name.clone())));
        };

        let mut last_retry_feedback: Option<String> = None;
        for attempt in 0..(tool.max_retries + 1) {
            if cancel_token.is_cancelled() {
                return Err(ToolEngineError::Cancelled);
            }
            let ctx = ToolContext {
                deps: Arc::clone(&deps),
                cancel_token: cancel_token.clone(),
                retries: attempt,
            };
            let invocation = tool.invoke(ctx, call.arguments.clone());

            let outcome = match tool.timeout {
                Some(timeout) => {
                    tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => return Err(ToolEngineError::Cancelled),
                        res = tokio::time::timeout(timeout, invocation) => match res {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(target: "tool_engine", tool = %call.name, ?timeout, "tool call timed out");
                                return Err(ToolEngineError::Timeout { name: call.name.clone(), timeout });
                            },
                        },
                    }
                },
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => return Err(ToolEngineError::Cancelled),
                        result = invocation => result,
                    }
                },
            };

            match outcome {
                ToolResult::Retry(feedback) => {
                    debug!(target: "tool_engine", tool = %call.name, attempt, "tool requested retry");
                    last_retry_feedback = Some(feedback);
                    continue;
                },
                other => return Ok(other),
            }
        }
        Ok(ToolResult::Retry(last_retry_feedback.unwrap_or_default()))
    }

    /// Runs `calls` sequentially, in order. A [`ToolResult::Deferred`]
    /// outcome stops the batch immediately: remaining calls are not
    /// executed, and results gathered so far are still returned (they are
    /// appended to the conversation by the caller before the run pauses).
    pub async fn run_batch(
        &self,
        deps: Arc<Deps>,
        calls: &[ToolCall],
        cancel_token: CancellationToken,
        observer: &dyn ToolEngineObserver,
    ) -> Result<BatchResult, ToolEngineError> {
        let mut batch = BatchResult::default();
        for call in calls {
            observer.on_start(call);
            let start = Instant::now();
            let result = self.run_single(Arc::clone(&deps), call, cancel_token.clone()).await?;
            let duration = start.elapsed();
            observer.on_complete(call, &result, duration);

            if let ToolResult::Deferred(deferral) = &result {
                batch.deferred_calls.push((call.clone(), deferral.clone()));
                batch.stopped_on_deferral = true;
                batch.results.push(CallOutcome {
                    call: call.clone(),
                    result,
                    duration,
                });
                break;
            }
            batch.results.push(CallOutcome {
                call: call.clone(),
                result,
                duration,
            });
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::tool::Tool;

    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        input: String,
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl Tool<(), Args, String> for AlwaysFails {
        fn name(&self) -> &str {
            "throwing_tool"
        }

        fn description(&self) -> &str {
            ""
        }

        fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
            serde_json::Map::new()
        }

        async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
            ToolResult::Failure(ToolError::Raised("boom".into()))
        }
    }

    struct SlowTool;
    #[async_trait::async_trait]
    impl Tool<(), Args, String> for SlowTool {
        fn name(&self) -> &str {
            "slow_tool"
        }

        fn description(&self) -> &str {
            ""
        }

        fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
            serde_json::Map::new()
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(10))
        }

        async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolResult::Success(String::new())
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: name.into(),
            arguments: "{}".into(),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_not_an_error() {
        let engine = ToolExecutionEngine::<()>::new(vec![]);
        let result = engine.run_single(Arc::new(()), &call("missing"), CancellationToken::new()).await.unwrap();
        assert!(matches!(result, ToolResult::Failure(ToolError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn tool_failure_is_surfaced_as_result() {
        let engine = ToolExecutionEngine::new(vec![BoxedTool::new(AlwaysFails)]);
        let result = engine.run_single(Arc::new(()), &call("throwing_tool"), CancellationToken::new()).await.unwrap();
        assert!(matches!(result, ToolResult::Failure(_)));
    }

    #[tokio::test]
    async fn timeout_is_a_fatal_engine_error() {
        let engine = ToolExecutionEngine::new(vec![BoxedTool::new(SlowTool)]);
        let result = engine.run_single(Arc::new(()), &call("slow_tool"), CancellationToken::new()).await;
        assert!(matches!(result, Err(ToolEngineError::Timeout { .. })));
    }

    #[tokio::test]
    async fn batch_stops_on_deferral_but_keeps_partial_results() {
        struct Defers;
        #[async_trait::async_trait]
        impl Tool<(), Args, String> for Defers {
            fn name(&self) -> &str {
                "deferring_tool"
            }

            fn description(&self) -> &str {
                ""
            }

            fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
                serde_json::Map::new()
            }

            async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
                ToolResult::Deferred(Deferral {
                    kind: crate::tool::DeferralKind::Approval,
                    id: "d1".into(),
                    reason: "needs approval".into(),
                })
            }
        }

        let engine = ToolExecutionEngine::new(vec![BoxedTool::new(AlwaysFails), BoxedTool::new(Defers), BoxedTool::new(AlwaysFails)]);
        let calls = vec![call("throwing_tool"), call("deferring_tool"), call("throwing_tool")];
        let batch = engine.run_batch(Arc::new(()), &calls, CancellationToken::new(), &NoopObserver).await.unwrap();
        assert!(batch.stopped_on_deferral);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.deferred_calls.len(), 1);
    }
}
