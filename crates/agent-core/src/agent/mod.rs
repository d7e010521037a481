//! The public entry point: an [`Agent`] bundles a model, a tool set, and the
//! policies that bound a run, and exposes the four ways to drive them —
//! `run`, `stream`, `iter`, and `resume` — over the single shared state
//! machine in [`loop_core`].

pub mod error;
pub mod loop_core;
pub mod state;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio_util::sync::CancellationToken;

pub use self::error::AgentError;
use self::loop_core::{
    IterationOutcome,
    LoopConfig,
    LoopEvent,
    OutputValidator,
    result_text,
    run_iteration,
};
pub use self::state::{
    PausedRun,
    PendingCall,
    Resolution,
    ResolutionFor,
    RunState,
};
use crate::message::Message;
use crate::model::Model;
use crate::retry::{
    RetryPolicy,
    UsageLimits,
};
use crate::tool::{
    BoxedTool,
    DeferralKind,
    ToolError,
};
use crate::tool_engine::{
    CallOutcome,
    ToolExecutionEngine,
};

/// A user-facing event produced by [`Agent::stream`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ContentDelta(String),
    ToolCallStarted(crate::message::ToolCall),
    ToolCallCompleted(CallOutcome),
    /// The final event of the stream, always exactly one and always last.
    Result(Result<String, AgentError>),
}

/// A coarse-grained step produced by [`Agent::iter`]: one per model call and
/// one per tool batch, rather than one per token.
#[derive(Debug, Clone)]
pub enum IterNode {
    ModelResponse(crate::message::CompletionResponse),
    ToolBatch(Vec<CallOutcome>),
    End(Box<Result<String, AgentError>>),
}

/// Immutable configuration shared by every run of an [`Agent`]: the model,
/// the registered tools, and the policies that bound iteration.
pub struct AgentConfig<Deps> {
    pub system_prompt: Option<String>,
    pub tools: Vec<BoxedTool<Deps>>,
    pub output_tool_name: Option<String>,
    pub output_validators: Vec<OutputValidator<Deps>>,
    pub max_iterations: u32,
    pub usage_limits: UsageLimits,
    pub retry_policy: RetryPolicy,
}

impl<Deps> Default for AgentConfig<Deps> {
    fn default() -> Self {
        Self {
            system_prompt: None,
            tools: Vec::new(),
            output_tool_name: None,
            output_validators: Vec::new(),
            max_iterations: 50,
            usage_limits: UsageLimits::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Drives a bounded dialogue between a model and a tool set. `Deps` is the
/// opaque, user-supplied context threaded through every tool call
/// (a database pool, an HTTP client, whatever the tools need).
pub struct Agent<Deps> {
    model: Arc<dyn Model>,
    tools: ToolExecutionEngine<Deps>,
    loop_config: LoopConfig<Deps>,
}

impl<Deps: Send + Sync + 'static> Agent<Deps> {
    pub fn new(model: Arc<dyn Model>, config: AgentConfig<Deps>) -> Self {
        let tools = ToolExecutionEngine::new(config.tools);
        let loop_config = LoopConfig {
            system_prompt: config.system_prompt,
            output_tool_name: config.output_tool_name,
            output_validators: config.output_validators,
            max_iterations: config.max_iterations,
            usage_limits: config.usage_limits,
            retry_policy: config.retry_policy,
        };
        Self {
            model,
            tools,
            loop_config,
        }
    }

    fn initial_state(&self, prompt: impl Into<String>) -> RunState {
        let mut state = RunState::new();
        if let Some(text) = self.loop_config.system_prompt.clone() {
            state.messages.push(Message::system(text));
        }
        state.messages.push(Message::user(prompt.into()));
        state
    }

    /// Blocks until the run reaches a terminal outcome: a final value, a
    /// fatal error, or a pause on deferred tool calls (surfaced as
    /// [`AgentError::HasDeferredTools`]).
    pub async fn run(&self, deps: Arc<Deps>, prompt: impl Into<String>, cancel_token: CancellationToken) -> Result<String, AgentError> {
        let mut state = self.initial_state(prompt);
        self.drive_to_completion(&deps, &mut state, &cancel_token, false).await
    }

    /// Resumes a [`PausedRun`] after the caller has resolved every pending
    /// deferral. `resolutions` must be a bijection with
    /// `paused.pending_calls`.
    pub async fn resume(&self, deps: Arc<Deps>, paused: PausedRun, resolutions: Vec<ResolutionFor>, cancel_token: CancellationToken) -> Result<String, AgentError> {
        let mut state = RunState::from_paused(&paused);
        self.apply_resolutions(&deps, &mut state, &paused, resolutions, &cancel_token).await?;
        self.drive_to_completion(&deps, &mut state, &cancel_token, false).await
    }

    async fn drive_to_completion(&self, deps: &Arc<Deps>, state: &mut RunState, cancel_token: &CancellationToken, streaming: bool) -> Result<String, AgentError> {
        loop {
            let outcome = run_iteration(
                self.model.as_ref(),
                &self.tools,
                deps,
                &self.loop_config,
                state,
                cancel_token,
                streaming,
                |_event| {},
            )
            .await?;
            match outcome {
                IterationOutcome::Continue => continue,
                IterationOutcome::Output(value) => return Ok(value),
                IterationOutcome::Paused(paused) => return Err(AgentError::HasDeferredTools(paused)),
            }
        }
    }

    /// Streams user-facing events as the run progresses. The stream always
    /// ends with exactly one [`AgentEvent::Result`]; a paused run surfaces as
    /// `Result(Err(AgentError::HasDeferredTools(_)))` just as `run` would.
    pub fn stream(self: Arc<Self>, deps: Arc<Deps>, prompt: impl Into<String>, cancel_token: CancellationToken) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        let prompt = prompt.into();
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut state = self.initial_state(prompt);
            let result = self.drive_streaming(&deps, &mut state, &cancel_token, &tx).await;
            let _ = tx.send(AgentEvent::Result(result)).await;
        });
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    async fn drive_streaming(&self, deps: &Arc<Deps>, state: &mut RunState, cancel_token: &CancellationToken, tx: &tokio::sync::mpsc::Sender<AgentEvent>) -> Result<String, AgentError> {
        loop {
            let outcome = run_iteration(self.model.as_ref(), &self.tools, deps, &self.loop_config, state, cancel_token, true, |event| {
                if let Some(mapped) = project_event(event) {
                    let _ = tx.try_send(mapped);
                }
            })
            .await?;
            match outcome {
                IterationOutcome::Continue => continue,
                IterationOutcome::Output(value) => return Ok(value),
                IterationOutcome::Paused(paused) => return Err(AgentError::HasDeferredTools(paused)),
            }
        }
    }

    /// Iterates over coarse-grained [`IterNode`]s: one per model call, one
    /// per tool batch, and a terminal `End`. Intended for callers that want
    /// to observe progress without the token-level granularity of `stream`.
    pub fn iter(self: Arc<Self>, deps: Arc<Deps>, prompt: impl Into<String>, cancel_token: CancellationToken) -> Pin<Box<dyn Stream<Item = IterNode> + Send>> {
        let prompt = prompt.into();
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut state = self.initial_state(prompt);
            let result = self.drive_iter(&deps, &mut state, &cancel_token, &tx).await;
            let _ = tx.send(IterNode::End(Box::new(result))).await;
        });
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    async fn drive_iter(&self, deps: &Arc<Deps>, state: &mut RunState, cancel_token: &CancellationToken, tx: &tokio::sync::mpsc::Sender<IterNode>) -> Result<String, AgentError> {
        loop {
            let mut batch = Vec::new();
            let outcome = run_iteration(self.model.as_ref(), &self.tools, deps, &self.loop_config, state, cancel_token, false, |event| match event {
                LoopEvent::ModelResponse(response) => {
                    let _ = tx.try_send(IterNode::ModelResponse(response));
                },
                LoopEvent::ToolCallCompleted(outcome) => batch.push(outcome),
                LoopEvent::ContentDelta(_) | LoopEvent::ToolCallStarted(_) => {},
            })
            .await?;
            if !batch.is_empty() {
                let _ = tx.send(IterNode::ToolBatch(batch)).await;
            }
            match outcome {
                IterationOutcome::Continue => continue,
                IterationOutcome::Output(value) => return Ok(value),
                IterationOutcome::Paused(paused) => return Err(AgentError::HasDeferredTools(paused)),
            }
        }
    }

    /// Turns each [`PendingCall`] plus its matching [`Resolution`] into the
    /// `ToolResult`-shaped message the model will see, appended to the
    /// resumed conversation in the same order the calls were originally
    /// deferred. An approved call is actually executed here, through the same
    /// engine a live run would have used.
    async fn apply_resolutions(
        &self,
        deps: &Arc<Deps>,
        state: &mut RunState,
        paused: &PausedRun,
        resolutions: Vec<ResolutionFor>,
        cancel_token: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut by_id: std::collections::HashMap<String, Resolution> = resolutions.into_iter().map(|r| (r.id, r.resolution)).collect();

        for pending in &paused.pending_calls {
            let Some(resolution) = by_id.remove(&pending.deferral.id) else {
                return Err(AgentError::InternalError(format!("missing resolution for deferred call {:?}", pending.deferral.id)));
            };
            let content = self.render_resolution(deps, pending, resolution, cancel_token).await?;
            state.messages.push(Message::tool_result(pending.tool_call.id.clone(), content));
        }
        if !by_id.is_empty() {
            return Err(AgentError::InternalError(format!("unexpected resolutions for unknown deferral ids: {:?}", by_id.keys().collect::<Vec<_>>())));
        }
        Ok(())
    }

    async fn render_resolution(
        &self,
        deps: &Arc<Deps>,
        pending: &PendingCall,
        resolution: Resolution,
        cancel_token: &CancellationToken,
    ) -> Result<String, AgentError> {
        match (pending.deferral.kind, resolution) {
            (DeferralKind::Approval, Resolution::Approved) => {
                let outcome = self.tools.run_single(Arc::clone(deps), &pending.tool_call, cancel_token.clone()).await?;
                Ok(result_text(&outcome))
            },
            (DeferralKind::Approval, Resolution::Denied { reason }) => {
                Ok(format!("denied{}", reason.map(|r| format!(": {r}")).unwrap_or_default()))
            },
            (_, Resolution::Completed { result }) => Ok(result),
            (_, Resolution::Failed { error }) => Ok(ToolError::Raised(error).to_string()),
            (DeferralKind::External, Resolution::Approved | Resolution::Denied { .. }) => {
                Ok("invalid resolution kind for an external deferral".to_string())
            },
        }
    }
}

fn project_event(event: LoopEvent) -> Option<AgentEvent> {
    match event {
        LoopEvent::ContentDelta(text) => Some(AgentEvent::ContentDelta(text)),
        LoopEvent::ToolCallStarted(call) => Some(AgentEvent::ToolCallStarted(call)),
        LoopEvent::ToolCallCompleted(outcome) => Some(AgentEvent::ToolCallCompleted(outcome)),
        LoopEvent::ModelResponse(_) => None,
    }
}
