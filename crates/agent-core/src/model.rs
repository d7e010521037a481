//! Provider-agnostic contract for a language model: a `complete`/`stream`
//! pair plus a capability declaration the agent loop validates requests
//! against before every call.
//!
//! Provider-specific wire codecs (Anthropic/OpenAI/Bedrock) are external
//! adapters implementing this trait; they are not part of this crate.

use std::pin::Pin;

use futures::Stream;
use serde::{
    Deserialize,
    Serialize,
};
use tokio_util::sync::CancellationToken;

use crate::message::{
    CompletionResponse,
    Message,
    StreamEvent,
    ToolSpec,
};

#[derive(Debug, Clone, Default)]
pub struct CompletionConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSpec>>,
    pub output_schema: Option<serde_json::Value>,
    pub system_prompt: Option<String>,
    pub config: CompletionConfig,
}

/// What a [`Model`] implementation supports. The agent loop validates a
/// request against this before issuing it, failing fast with
/// [`LlmError::CapabilityNotSupported`] rather than letting the provider
/// reject it after a round trip.
#[derive(Debug, Clone, Copy)]
pub struct ModelCapabilities {
    pub tools: bool,
    pub images: bool,
    pub system_messages: bool,
    pub temperature: bool,
    pub max_context_tokens: Option<usize>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            tools: true,
            images: false,
            system_messages: true,
            temperature: true,
            max_context_tokens: None,
        }
    }
}

/// A provider-level failure. The engine retries only the kinds a
/// [`crate::retry::RetryPolicy`] is configured for; others propagate on
/// first occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited{}", .retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<std::time::Duration> },
    #[error("server error: {0}")]
    ServerError(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("context length exceeded (max {max})")]
    ContextLengthExceeded { max: usize },
    #[error("content filtered: {0}")]
    ContentFiltered(String),
    #[error("capability not supported: {0}")]
    CapabilityNotSupported(String),
    #[error("failed to decode response: {0}")]
    DecodingError(String),
}

/// Validates `request` against `caps`, failing fast rather than letting a
/// provider reject an unsupported request after a round trip.
pub fn validate_request(request: &CompletionRequest, caps: &ModelCapabilities) -> Result<(), LlmError> {
    if request.tools.as_ref().is_some_and(|t| !t.is_empty()) && !caps.tools {
        return Err(LlmError::CapabilityNotSupported("tools".into()));
    }
    if request.config.temperature.is_some() && !caps.temperature {
        return Err(LlmError::CapabilityNotSupported("temperature".into()));
    }
    if request.system_prompt.is_some() && !caps.system_messages {
        return Err(LlmError::CapabilityNotSupported("system messages".into()));
    }
    Ok(())
}

/// A language-model backend. Implementations must be safe to share across
/// concurrent runs and must be cancel-safe: dropping the returned stream
/// before it completes must not leak resources or corrupt later calls.
#[async_trait::async_trait]
pub trait Model: std::fmt::Debug + Send + Sync + 'static {
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    async fn complete(&self, request: CompletionRequest, cancel_token: CancellationToken) -> Result<CompletionResponse, LlmError>;

    /// Streams the same logical response as [`Model::complete`]. The engine
    /// assumes the final `Done(response)` aggregates the same `tool_calls`,
    /// `content`, `stop_reason`, and `usage` that `complete` would have
    /// returned for the same request — it never assumes streaming and
    /// non-streaming produce identical intermediate tokens.
    fn stream(
        &self,
        request: CompletionRequest,
        cancel_token: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>>;
}

pub mod mock;
pub use mock::{
    MockModel,
    MockResponse,
};
