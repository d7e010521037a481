//! End-to-end coverage of the agent loop against a scripted model: the
//! handful of scenarios a shared state machine across `run`/`stream`/`iter`/
//! `resume` needs to get right, plus a few boundary conditions.

use std::sync::Arc;
use std::time::Duration;

use agent_core::message::{
    CompletionResponse,
    StopReason,
    ToolCall,
    Usage,
};
use agent_core::model::mock::MockModel;
use agent_core::tool::{
    BoxedTool,
    Tool,
    ToolContext,
    ToolError,
    ToolResult,
};
use agent_core::{
    Agent,
    AgentConfig,
    AgentError,
    Deferral,
    DeferralKind,
    IterNode,
    Resolution,
    ResolutionFor,
    RetryPolicy,
    UsageLimits,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize, Default)]
struct Args {
    #[serde(default)]
    value: String,
}

struct FlakyTool;
#[async_trait::async_trait]
impl Tool<(), Args, String> for FlakyTool {
    fn name(&self) -> &str {
        "flaky_tool"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
        ToolResult::Failure(ToolError::Raised("boom".into()))
    }
}

struct GoodTool;
#[async_trait::async_trait]
impl Tool<(), Args, String> for GoodTool {
    fn name(&self) -> &str {
        "good_tool"
    }

    fn description(&self) -> &str {
        "always succeeds"
    }

    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
        ToolResult::Success("ok".to_string())
    }
}

struct PickyTool;
#[async_trait::async_trait]
impl Tool<(), Args, String> for PickyTool {
    fn name(&self) -> &str {
        "picky_tool"
    }

    fn description(&self) -> &str {
        "rejects any arguments it's given"
    }

    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    fn max_retries(&self) -> u32 {
        0
    }

    async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
        ToolResult::Retry("wrong shape, try again with a \"value\" field".to_string())
    }
}

struct SlowTool;
#[async_trait::async_trait]
impl Tool<(), Args, String> for SlowTool {
    fn name(&self) -> &str {
        "slow_tool"
    }

    fn description(&self) -> &str {
        "never finishes on its own"
    }

    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ToolResult::Success("too late".to_string())
    }
}

// Defers on its first invocation and actually performs the deletion on any
// invocation after that, so a resume that approves it has something real to
// execute rather than re-triggering the same deferral.
struct DeferringTool {
    invocations: Arc<std::sync::atomic::AtomicU32>,
}

impl DeferringTool {
    fn new() -> (Self, Arc<std::sync::atomic::AtomicU32>) {
        let invocations = Arc::new(std::sync::atomic::AtomicU32::new(0));
        (Self { invocations: invocations.clone() }, invocations)
    }
}

#[async_trait::async_trait]
impl Tool<(), Args, String> for DeferringTool {
    fn name(&self) -> &str {
        "deferring_tool"
    }

    fn description(&self) -> &str {
        "needs approval before its first real execution"
    }

    fn input_schema(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    async fn call(&self, _ctx: &ToolContext<()>, _args: Args) -> ToolResult<String> {
        let attempt = self.invocations.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempt == 0 {
            return ToolResult::Deferred(Deferral {
                kind: DeferralKind::Approval,
                id: "approve-me".to_string(),
                reason: "destructive operation".to_string(),
            });
        }
        ToolResult::Success("deleted".to_string())
    }
}

fn tool_call(id: &str, name: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: "{}".to_string(),
    }
}

fn tool_use(calls: Vec<ToolCall>, usage: Usage) -> CompletionResponse {
    CompletionResponse {
        content: None,
        refusal: None,
        tool_calls: calls,
        stop_reason: StopReason::ToolUse,
        usage,
    }
}

fn end_turn(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: Some(text.to_string()),
        refusal: None,
        tool_calls: vec![],
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

fn config_with<Deps>(tools: Vec<BoxedTool<Deps>>) -> AgentConfig<Deps> {
    AgentConfig {
        tools,
        max_iterations: 20,
        ..AgentConfig::default()
    }
}

// Scenario: a failing tool is surfaced to the model as a result, not a fatal
// error, and the model gets a second turn to recover.
#[tokio::test]
async fn throwing_tool_is_surfaced_to_the_model_and_run_recovers() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "flaky_tool")], Usage::default()))
        .with_response(end_turn("handled the failure"));
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(FlakyTool)]));

    let output = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "handled the failure");
    assert_eq!(model.received_requests().len(), 2);
}

// Scenario: a tool that exhausts its own retries without succeeding surfaces
// a `Retry` result to the model, which picks a different tool on its next
// turn; the run takes three model requests in total.
#[tokio::test]
async fn exhausted_tool_retry_changes_the_models_next_choice() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "picky_tool")], Usage::default()))
        .with_response(tool_use(vec![tool_call("2", "good_tool")], Usage::default()))
        .with_response(end_turn("done"));
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(PickyTool), BoxedTool::new(GoodTool)]));

    let output = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "done");
    assert_eq!(model.received_requests().len(), 3);
}

// Scenario: a model that never stops calling tools hits the iteration
// ceiling exactly, without an extra model call past the limit.
#[tokio::test]
async fn max_iterations_reached_stops_without_a_further_model_call() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "good_tool")], Usage::default()))
        .with_response(tool_use(vec![tool_call("2", "good_tool")], Usage::default()))
        .with_response(tool_use(vec![tool_call("3", "good_tool")], Usage::default()));
    let mut config = config_with(vec![BoxedTool::new(GoodTool)]);
    config.max_iterations = 3;
    let agent = Agent::new(Arc::new(model.clone()), config);

    let err = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, AgentError::MaxIterationsReached(3)));
    assert_eq!(model.received_requests().len(), 3);
}

// Scenario: a token ceiling breached by the very first response blocks every
// subsequent turn, even though more responses were scripted.
#[tokio::test]
async fn token_limit_blocks_subsequent_turns() {
    let model = MockModel::new()
        .with_response(end_turn("more than the budget allows"))
        .with_response(end_turn("never reached"));
    let mut config = config_with::<()>(vec![]);
    config.usage_limits = UsageLimits {
        max_total_tokens: Some(5),
        ..UsageLimits::default()
    };
    let agent = Agent::new(Arc::new(model.clone()), config);

    let err = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::UsageLimitExceeded {
            kind: agent_core::retry::UsageLimitKind::Tokens,
            ..
        }
    ));
    assert_eq!(model.received_requests().len(), 1);
}

// Scenario: a retryable provider error is absorbed by the retry policy and
// the run completes after a second attempt at the same turn.
#[tokio::test]
async fn retry_policy_recovers_from_a_single_rate_limit() {
    let model = MockModel::new().with_response(agent_core::LlmError::RateLimited { retry_after: None }).with_response(end_turn("recovered"));
    let mut config = config_with::<()>(vec![]);
    config.retry_policy = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_fraction: 0.0,
        ..RetryPolicy::default()
    };
    let agent = Agent::new(Arc::new(model.clone()), config);

    let output = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "recovered");
    assert_eq!(model.received_requests().len(), 2);
}

// Scenario: a deferred tool call pauses the run rather than failing it, and
// resuming with a resolution lets it complete without replaying the turn
// that produced the deferral.
#[tokio::test]
async fn deferred_tool_pauses_then_resumes_to_completion() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "deferring_tool")], Usage::default()))
        .with_response(end_turn("approved and finished"));
    let (tool, invocations) = DeferringTool::new();
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(tool)]));

    let err = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap_err();
    let paused = match err {
        AgentError::HasDeferredTools(paused) => *paused,
        other => panic!("expected a pause, got {other:?}"),
    };
    assert_eq!(paused.pending_calls.len(), 1);
    assert_eq!(model.received_requests().len(), 1);
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);

    let resolutions = vec![ResolutionFor {
        id: paused.pending_calls[0].deferral.id.clone(),
        resolution: Resolution::Approved,
    }];
    let output = agent.resume(Arc::new(()), paused, resolutions, CancellationToken::new()).await.unwrap();

    assert_eq!(output, "approved and finished");
    // Resuming issues exactly one more model call; it never replays the turn
    // that produced the deferral.
    assert_eq!(model.received_requests().len(), 2);
    // The dangerous-delete tool was invoked exactly once more than before the
    // pause: approval executes it for real instead of synthesising a result.
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deferred_tool_denial_is_reported_back_to_the_model() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "deferring_tool")], Usage::default()))
        .with_response(end_turn("backed off"));
    let (tool, invocations) = DeferringTool::new();
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(tool)]));

    let err = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap_err();
    let paused = match err {
        AgentError::HasDeferredTools(paused) => *paused,
        other => panic!("expected a pause, got {other:?}"),
    };

    let resolutions = vec![ResolutionFor {
        id: paused.pending_calls[0].deferral.id.clone(),
        resolution: Resolution::Denied {
            reason: Some("not today".to_string()),
        },
    }];
    let output = agent.resume(Arc::new(()), paused, resolutions, CancellationToken::new()).await.unwrap();

    assert_eq!(output, "backed off");
    // A denial never executes the tool at all.
    assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// Invariant: every assistant tool-use turn is followed by exactly one
// tool-result per requested call, before the model's next turn.
#[tokio::test]
async fn tool_results_follow_the_assistant_turn_one_per_call_in_order() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "good_tool"), tool_call("2", "flaky_tool")], Usage::default()))
        .with_response(end_turn("summary"));
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(GoodTool), BoxedTool::new(FlakyTool)]));

    agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    let second_request = &model.received_requests()[1];
    let roles: Vec<&str> = second_request
        .messages
        .iter()
        .map(|m| match m {
            agent_core::message::Message::System { .. } => "system",
            agent_core::message::Message::User { .. } => "user",
            agent_core::message::Message::Assistant { .. } => "assistant",
            agent_core::message::Message::ToolResult { .. } => "tool_result",
        })
        .collect();
    // user, assistant(tool_use), tool_result, tool_result
    assert_eq!(roles, vec!["user", "assistant", "tool_result", "tool_result"]);
    let call_ids: Vec<&str> = second_request
        .messages
        .iter()
        .filter_map(|m| match m {
            agent_core::message::Message::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(call_ids, vec!["1", "2"]);
}

// Invariant: `run` and `stream` agree on the final output for the same
// scripted transcript.
#[tokio::test]
async fn stream_and_run_agree_on_output_for_the_same_transcript() {
    let script = |m: MockModel| {
        m.with_response(tool_use(vec![tool_call("1", "good_tool")], Usage::default()))
            .with_response(end_turn("converged"))
    };

    let run_model = script(MockModel::new());
    let run_agent = Agent::new(Arc::new(run_model), config_with(vec![BoxedTool::new(GoodTool)]));
    let run_output = run_agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    let stream_model = script(MockModel::new());
    let stream_agent = Arc::new(Agent::new(Arc::new(stream_model), config_with(vec![BoxedTool::new(GoodTool)])));
    let mut events = stream_agent.stream(Arc::new(()), "do it", CancellationToken::new());
    let mut last = None;
    while let Some(event) = events.next().await {
        if let agent_core::AgentEvent::Result(result) = event {
            last = Some(result);
        }
    }
    let stream_output = last.expect("stream always ends with a Result event").unwrap();

    assert_eq!(run_output, stream_output);
}

// Invariant: `iter` yields one node per model call and one per non-empty
// tool batch, terminating in exactly one `End`.
#[tokio::test]
async fn iter_yields_ordered_nodes_ending_once() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "good_tool")], Usage::default()))
        .with_response(end_turn("finished"));
    let agent = Arc::new(Agent::new(Arc::new(model), config_with(vec![BoxedTool::new(GoodTool)])));

    let nodes: Vec<IterNode> = agent.iter(Arc::new(()), "do it", CancellationToken::new()).collect().await;

    let mut ends = 0;
    let mut saw_batch_after_response = false;
    let mut saw_response = false;
    for node in &nodes {
        match node {
            IterNode::ModelResponse(_) => saw_response = true,
            IterNode::ToolBatch(_) => {
                assert!(saw_response, "a tool batch must follow a model response");
                saw_batch_after_response = true;
            },
            IterNode::End(_) => ends += 1,
        }
    }
    assert_eq!(ends, 1, "exactly one End node");
    assert!(saw_batch_after_response);
    assert!(matches!(nodes.last(), Some(IterNode::End(_))));
}

// Boundary: no tools registered at all, the model answers directly.
#[tokio::test]
async fn empty_tool_set_produces_a_plain_text_answer() {
    let model = MockModel::new().with_response(end_turn("no tools needed"));
    let agent = Agent::new(Arc::new(model.clone()), config_with::<()>(vec![]));

    let output = agent.run(Arc::new(()), "hello", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "no tools needed");
    assert!(model.received_requests()[0].tools.is_none());
}

// Boundary: the model asks for a tool name that was never registered; the
// engine reports it as a tool result, not a fatal error, and the model gets
// another turn.
#[tokio::test]
async fn unknown_tool_name_round_trips_as_a_not_found_result() {
    let model = MockModel::new()
        .with_response(tool_use(vec![tool_call("1", "does_not_exist")], Usage::default()))
        .with_response(end_turn("adjusted"));
    let agent = Agent::new(Arc::new(model.clone()), config_with::<()>(vec![]));

    let output = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "adjusted");
    let second_request = &model.received_requests()[1];
    let texts: Vec<&str> = second_request
        .messages
        .iter()
        .filter_map(|m| match m {
            agent_core::message::Message::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert!(texts[0].contains("does_not_exist"));
}

// Boundary: arguments the model sent are not valid JSON; reported to the
// model as a parse failure instead of panicking the engine.
#[tokio::test]
async fn malformed_arguments_are_reported_to_the_model() {
    let malformed_call = ToolCall {
        id: "1".to_string(),
        name: "good_tool".to_string(),
        arguments: "not json".to_string(),
    };
    let model = MockModel::new().with_response(tool_use(vec![malformed_call], Usage::default())).with_response(end_turn("recovered"));
    let agent = Agent::new(Arc::new(model.clone()), config_with(vec![BoxedTool::new(GoodTool)]));

    let output = agent.run(Arc::new(()), "do it", CancellationToken::new()).await.unwrap();

    assert_eq!(output, "recovered");
    let second_request = &model.received_requests()[1];
    let texts: Vec<&str> = second_request
        .messages
        .iter()
        .filter_map(|m| match m {
            agent_core::message::Message::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert!(texts[0].contains("parse"));
}

// Boundary: cancelling mid-tool-call stops the run with `Cancelled` instead
// of waiting out a tool that will never return on its own.
#[tokio::test]
async fn cancellation_mid_tool_call_stops_the_run() {
    let model = MockModel::new().with_response(tool_use(vec![tool_call("1", "slow_tool")], Usage::default()));
    let agent = Agent::new(Arc::new(model), config_with(vec![BoxedTool::new(SlowTool)]));
    let cancel_token = CancellationToken::new();

    let cancel_after = cancel_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_after.cancel();
    });

    let err = agent.run(Arc::new(()), "do it", cancel_token).await.unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
}

// Boundary: two independent runs against the same agent get distinct run
// ids, even when driven concurrently.
#[tokio::test]
async fn concurrent_runs_get_distinct_run_ids() {
    let paused_run_id = |err: AgentError| -> uuid::Uuid {
        match err {
            AgentError::HasDeferredTools(paused) => paused.run_id,
            other => panic!("expected a pause, got {other:?}"),
        }
    };

    let model_a = MockModel::new().with_response(tool_use(vec![tool_call("1", "deferring_tool")], Usage::default()));
    let agent_a = Agent::new(Arc::new(model_a), config_with(vec![BoxedTool::new(DeferringTool::new().0)]));
    let model_b = MockModel::new().with_response(tool_use(vec![tool_call("1", "deferring_tool")], Usage::default()));
    let agent_b = Agent::new(Arc::new(model_b), config_with(vec![BoxedTool::new(DeferringTool::new().0)]));

    let (err_a, err_b) = tokio::join!(
        agent_a.run(Arc::new(()), "first", CancellationToken::new()),
        agent_b.run(Arc::new(()), "second", CancellationToken::new()),
    );

    let run_id_a = paused_run_id(err_a.unwrap_err());
    let run_id_b = paused_run_id(err_b.unwrap_err());
    assert_ne!(run_id_a, run_id_b);
}

// Boundary: the model's stream breaks after emitting real content but before
// a Done event. The deltas already delivered must reach the caller, and the
// run must end in a terminal error rather than hang or silently swallow the
// partial output.
#[tokio::test]
async fn stream_interrupted_mid_response_surfaces_the_error_after_partial_deltas() {
    use agent_core::model::mock::MockResponse;

    let model = MockModel::new().with_response(MockResponse::interrupted(
        vec!["Here is the file".to_string(), " content so far".to_string()],
        agent_core::LlmError::DecodingError("connection reset mid-stream".into()),
    ));
    let agent = Arc::new(Agent::new(Arc::new(model), config_with::<()>(vec![])));

    let mut events = agent.stream(Arc::new(()), "read it", CancellationToken::new());
    let mut deltas = Vec::new();
    let mut result = None;
    while let Some(event) = events.next().await {
        match event {
            agent_core::AgentEvent::ContentDelta(text) => deltas.push(text),
            agent_core::AgentEvent::Result(r) => result = Some(r),
            _ => {},
        }
    }

    assert_eq!(deltas, vec!["Here is the file", " content so far"], "partial deltas must have been emitted");
    match result.expect("stream always ends with a Result event") {
        Err(AgentError::RetriesExhausted { last_error, .. }) => {
            assert!(matches!(last_error, agent_core::LlmError::DecodingError(_)));
        },
        other => panic!("expected the interrupted stream to surface as an error, got {other:?}"),
    }
}
