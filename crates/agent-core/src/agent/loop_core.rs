//! The single authoritative state machine shared by `run`, `stream`, `iter`,
//! and `resume`. Each mode differs only in how it is fed the next model
//! response (blocking vs. streaming) and what it does with the [`LoopEvent`]s
//! a single iteration emits; the stop-reason dispatch, usage-limit checks,
//! and tool-processing logic live in exactly one place: [`run_iteration`].

use std::sync::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::error::AgentError;
use crate::agent::state::{
    PausedRun,
    PendingCall,
    RunState,
};
use crate::message::{
    CompletionResponse,
    Message,
    StopReason,
    ToolCall,
    ToolSpec,
};
use crate::model::{
    CompletionConfig,
    CompletionRequest,
    LlmError,
    Model,
    validate_request,
};
use crate::retry::{
    RetryPolicy,
    UsageLimitKind,
    UsageLimits,
};
use crate::tool::{
    BoxedTool,
    ToolResult,
};
use crate::tool_engine::{
    CallOutcome,
    ToolEngineObserver,
    ToolExecutionEngine,
};

/// Emitted uniformly by [`run_iteration`]; `stream` projects these into its
/// own public event type, `iter` batches them into coarse nodes, and `run`
/// simply drains them.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    ContentDelta(String),
    ModelResponse(CompletionResponse),
    ToolCallStarted(ToolCall),
    ToolCallCompleted(CallOutcome),
}

pub enum IterationOutcome {
    Continue,
    Output(String),
    Paused(Box<PausedRun>),
}

/// `(deps, output) -> Ok(refined output) | Err(feedback)`. An `Err` becomes a
/// synthetic tool-result message and the loop continues instead of
/// terminating.
pub struct OutputValidator<Deps> {
    pub validate: Box<dyn Fn(&Deps, String) -> Result<String, String> + Send + Sync>,
}

pub struct LoopConfig<Deps> {
    pub system_prompt: Option<String>,
    /// The name of a registered tool whose successful invocation delivers the
    /// final result, instead of plain `EndTurn` content. `None` means the run
    /// always finishes on `EndTurn` content.
    pub output_tool_name: Option<String>,
    pub output_validators: Vec<OutputValidator<Deps>>,
    pub max_iterations: u32,
    pub usage_limits: UsageLimits,
    pub retry_policy: RetryPolicy,
}

fn tool_spec<Deps>(tool: &BoxedTool<Deps>) -> ToolSpec {
    ToolSpec {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

/// Runs exactly one iteration of the shared loop: one model call, and — if
/// the model asked for tools — one batch of tool execution. See module docs.
#[allow(clippy::too_many_arguments)]
pub async fn run_iteration<Deps: Send + Sync + 'static>(
    model: &dyn Model,
    tools: &ToolExecutionEngine<Deps>,
    deps: &Arc<Deps>,
    config: &LoopConfig<Deps>,
    state: &mut RunState,
    cancel_token: &CancellationToken,
    streaming: bool,
    mut on_event: impl FnMut(LoopEvent),
) -> Result<IterationOutcome, AgentError> {
    if let Some(max) = config.usage_limits.max_requests {
        if state.request_count >= max {
            return Err(AgentError::UsageLimitExceeded {
                kind: UsageLimitKind::Requests,
                used: state.request_count as u64,
                limit: max as u64,
            });
        }
    }
    if state.step >= config.max_iterations {
        return Err(AgentError::MaxIterationsReached(config.max_iterations));
    }
    state.step += 1;

    let tool_specs: Vec<ToolSpec> = tools.tools().map(tool_spec).collect();
    let request = CompletionRequest {
        messages: state.messages.clone(),
        tools: if tool_specs.is_empty() { None } else { Some(tool_specs) },
        output_schema: None,
        system_prompt: config.system_prompt.clone(),
        config: CompletionConfig::default(),
    };
    if let Err(e) = validate_request(&request, &model.capabilities()) {
        return Err(AgentError::UnexpectedModelBehavior(e.to_string()));
    }
    if cancel_token.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    let response = call_model_with_retry(model, request, &config.retry_policy, cancel_token, streaming, &mut on_event).await?;
    if cancel_token.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    state.messages.push(Message::Assistant {
        text: response.content.clone(),
        tool_calls: response.tool_calls.clone(),
    });
    state.request_count += 1;
    state.usage += response.usage;
    on_event(LoopEvent::ModelResponse(response.clone()));

    if let Some(max) = config.usage_limits.max_total_tokens {
        if state.usage.total() > max {
            return Err(AgentError::UsageLimitExceeded {
                kind: UsageLimitKind::Tokens,
                used: state.usage.total(),
                limit: max,
            });
        }
    }

    match response.stop_reason {
        StopReason::ToolUse => {},
        StopReason::EndTurn | StopReason::StopSequence => {
            if let Some(refusal) = &response.refusal {
                return Err(AgentError::UnexpectedModelBehavior(format!("refused: {refusal}")));
            }
            let Some(content) = response.content.clone() else {
                return Err(AgentError::UnexpectedModelBehavior("no output tool".into()));
            };
            if config.output_tool_name.is_none() {
                return finish_output(config, deps, content, None, state);
            }
            return Err(AgentError::UnexpectedModelBehavior("no output tool".into()));
        },
        StopReason::MaxTokens => return Err(AgentError::UnexpectedModelBehavior("max tokens / truncated".into())),
        StopReason::ContentFiltered | StopReason::Guardrail => return Err(AgentError::UnexpectedModelBehavior("filtered".into())),
    }

    if let Some(max) = config.usage_limits.max_tool_calls {
        let prospective = state.tool_call_count as u64 + response.tool_calls.len() as u64;
        if prospective > max as u64 {
            return Err(AgentError::UsageLimitExceeded {
                kind: UsageLimitKind::ToolCalls,
                used: prospective,
                limit: max as u64,
            });
        }
    }

    let observer = EventObserver {
        on_event: Mutex::new(&mut on_event),
    };
    let batch = tools.run_batch(Arc::clone(deps), &response.tool_calls, cancel_token.clone(), &observer).await?;
    state.tool_call_count += batch.results.len() as u32;

    for outcome in &batch.results {
        if config.output_tool_name.as_deref() == Some(outcome.call.name.as_str()) {
            continue;
        }
        state.messages.push(Message::tool_result(outcome.call.id.clone(), result_text(&outcome.result)));
    }

    if batch.stopped_on_deferral {
        let pending_calls = batch
            .deferred_calls
            .iter()
            .map(|(call, deferral)| PendingCall {
                tool_call: call.clone(),
                deferral: deferral.clone(),
            })
            .collect();
        let paused = PausedRun {
            run_id: state.run_id,
            messages: state.messages.clone(),
            usage: state.usage,
            request_count: state.request_count,
            tool_call_count: state.tool_call_count,
            pending_calls,
        };
        return Ok(IterationOutcome::Paused(Box::new(paused)));
    }

    if let Some(output_tool_name) = &config.output_tool_name {
        if let Some(outcome) = batch.results.iter().find(|o| &o.call.name == output_tool_name) {
            match &outcome.result {
                ToolResult::Success(content) => {
                    return finish_output(config, deps, content.clone(), Some(outcome.call.id.clone()), state);
                },
                other => {
                    state.messages.push(Message::tool_result(outcome.call.id.clone(), result_text(other)));
                },
            }
        }
    }

    Ok(IterationOutcome::Continue)
}

pub(crate) fn result_text(result: &ToolResult<String>) -> String {
    match result {
        ToolResult::Success(s) => s.clone(),
        ToolResult::Retry(feedback) => feedback.clone(),
        ToolResult::Failure(e) => e.to_string(),
        ToolResult::Deferred(d) => format!("deferred ({:?}): {}", d.kind, d.reason),
    }
}

fn finish_output<Deps>(
    config: &LoopConfig<Deps>,
    deps: &Arc<Deps>,
    content: String,
    call_id: Option<String>,
    state: &mut RunState,
) -> Result<IterationOutcome, AgentError> {
    let mut value = content;
    for validator in &config.output_validators {
        match (validator.validate)(deps, value.clone()) {
            Ok(refined) => value = refined,
            Err(feedback) => {
                let id = call_id.unwrap_or_else(|| format!("output-validation-{}", state.step));
                state.messages.push(Message::tool_result(id, feedback));
                return Ok(IterationOutcome::Continue);
            },
        }
    }
    Ok(IterationOutcome::Output(value))
}

struct EventObserver<'a, F: FnMut(LoopEvent)> {
    on_event: Mutex<&'a mut F>,
}

impl<F: FnMut(LoopEvent) + Send> ToolEngineObserver for EventObserver<'_, F> {
    fn on_start(&self, call: &ToolCall) {
        (self.on_event.lock().unwrap())(LoopEvent::ToolCallStarted(call.clone()));
    }

    fn on_complete(&self, call: &ToolCall, result: &ToolResult<String>, duration: Duration) {
        (self.on_event.lock().unwrap())(LoopEvent::ToolCallCompleted(CallOutcome {
            call: call.clone(),
            result: result.clone(),
            duration,
        }));
    }
}

async fn call_model_with_retry(
    model: &dyn Model,
    request: CompletionRequest,
    policy: &RetryPolicy,
    cancel_token: &CancellationToken,
    streaming: bool,
    on_event: &mut impl FnMut(LoopEvent),
) -> Result<CompletionResponse, AgentError> {
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::from_os_rng();
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.jittered_delay(attempt, &mut rng);
            if delay > Duration::ZERO {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel_token.cancelled() => return Err(AgentError::Cancelled),
                }
            }
        }
        if cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let result = if streaming {
            stream_once(model, request.clone(), cancel_token.clone(), on_event).await
        } else {
            model.complete(request.clone(), cancel_token.clone()).await
        };

        match result {
            Ok(response) => return Ok(response),
            Err(e) => {
                let retryable = policy.is_retryable(&e) && attempt + 1 < policy.max_attempts;
                if retryable {
                    warn!(target: "agent_loop", error = %e, attempt, "retrying model call");
                    last_error = Some(e);
                    continue;
                }
                return Err(AgentError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: e,
                });
            },
        }
    }
    Err(AgentError::RetriesExhausted {
        attempts: policy.max_attempts,
        last_error: last_error.unwrap_or(LlmError::ServerError("no attempts made".into())),
    })
}

async fn stream_once(
    model: &dyn Model,
    request: CompletionRequest,
    cancel_token: CancellationToken,
    on_event: &mut impl FnMut(LoopEvent),
) -> Result<CompletionResponse, LlmError> {
    let mut stream = model.stream(request, cancel_token);
    let mut pending: HashMap<String, (String, String)> = HashMap::new();

    while let Some(event) = stream.next().await {
        match event? {
            crate::message::StreamEvent::ContentDelta(text) => {
                on_event(LoopEvent::ContentDelta(text));
            },
            crate::message::StreamEvent::ToolCallStart { id, name } => {
                pending.insert(id, (name, String::new()));
            },
            crate::message::StreamEvent::ToolCallArgsDelta { id, delta } => {
                if let Some((_, buf)) = pending.get_mut(&id) {
                    buf.push_str(&delta);
                }
            },
            crate::message::StreamEvent::ToolCallEnd { .. } => {},
            crate::message::StreamEvent::Usage(_) => {},
            crate::message::StreamEvent::Done(response) => return Ok(response),
        }
    }
    Err(LlmError::DecodingError("stream ended without a terminal Done event".into()))
}
