//! A scripted [`Model`] used to drive the engine's test scenarios: each call
//! consumes the next configured [`MockResponse`] in order, panicking if the
//! engine makes more calls than were configured.

use std::pin::Pin;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    trace,
};

use super::{
    CompletionRequest,
    LlmError,
    Model,
};
use crate::message::{
    CompletionResponse,
    StreamEvent,
};

#[derive(Debug, Clone)]
pub struct MockModel {
    inner: Arc<Mutex<Inner>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    pub fn with_response(self, response: impl Into<MockResponse>) -> Self {
        self.inner.lock().unwrap().mock_responses.push(response.into());
        self
    }

    /// The requests observed so far, in call order.
    pub fn received_requests(&self) -> Vec<CompletionRequest> {
        self.inner.lock().unwrap().received_requests.clone()
    }

    fn next_response(&self, request: &CompletionRequest) -> MockResponse {
        let mut inner = self.inner.lock().unwrap();
        let Some(response) = inner.mock_responses.get(inner.response_index).cloned() else {
            error!(?request, "mock model received an unexpected request");
            panic!("mock model received an unexpected request: {request:?}");
        };
        inner.received_requests.push(request.clone());
        inner.response_index += 1;
        response
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Either a complete model turn (success or outright failure) or a stream
/// that delivers some content and then breaks mid-response — the shape
/// `complete()` has no use for (there is no partial non-streaming result) but
/// `stream()` needs to model a connection that dies after emitting real
/// deltas.
#[derive(Debug, Clone)]
enum ResponseKind {
    Complete(Result<CompletionResponse, LlmError>),
    Interrupted { partial_deltas: Vec<String>, error: LlmError },
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    kind: ResponseKind,
    time_to_first_chunk_delay: Option<Duration>,
}

impl MockResponse {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.time_to_first_chunk_delay = Some(delay);
        self
    }

    /// A stream that emits `partial_deltas` as real `ContentDelta` events and
    /// then breaks with `error` instead of ever reaching `Done` — the
    /// scripted counterpart of a connection dropping mid-response. `complete`
    /// sees only the terminal `error`.
    pub fn interrupted<S: Into<String>>(partial_deltas: Vec<S>, error: LlmError) -> Self {
        Self {
            kind: ResponseKind::Interrupted {
                partial_deltas: partial_deltas.into_iter().map(Into::into).collect(),
                error,
            },
            time_to_first_chunk_delay: None,
        }
    }

    fn stream_events(&self) -> Vec<Result<StreamEvent, LlmError>> {
        match &self.kind {
            ResponseKind::Complete(Err(e)) => vec![Err(e.clone())],
            ResponseKind::Complete(Ok(response)) => {
                let mut events = Vec::new();
                if let Some(text) = &response.content {
                    events.push(Ok(StreamEvent::ContentDelta(text.clone())));
                }
                for call in &response.tool_calls {
                    events.push(Ok(StreamEvent::ToolCallStart {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    }));
                    events.push(Ok(StreamEvent::ToolCallArgsDelta {
                        id: call.id.clone(),
                        delta: call.arguments.clone(),
                    }));
                    events.push(Ok(StreamEvent::ToolCallEnd { id: call.id.clone() }));
                }
                events.push(Ok(StreamEvent::Usage(response.usage)));
                events.push(Ok(StreamEvent::Done(response.clone())));
                events
            },
            ResponseKind::Interrupted { partial_deltas, error } => {
                let mut events: Vec<_> = partial_deltas.iter().map(|d| Ok(StreamEvent::ContentDelta(d.clone()))).collect();
                events.push(Err(error.clone()));
                events
            },
        }
    }

    async fn send_stream(self, tx: mpsc::Sender<Result<StreamEvent, LlmError>>) {
        trace!(?self.kind, "beginning stream for mock response");
        if let Some(delay) = self.time_to_first_chunk_delay {
            tokio::time::sleep(delay).await;
        }
        for event in self.stream_events() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

impl From<CompletionResponse> for MockResponse {
    fn from(value: CompletionResponse) -> Self {
        Self {
            kind: ResponseKind::Complete(Ok(value)),
            time_to_first_chunk_delay: None,
        }
    }
}

impl From<LlmError> for MockResponse {
    fn from(value: LlmError) -> Self {
        Self {
            kind: ResponseKind::Complete(Err(value)),
            time_to_first_chunk_delay: None,
        }
    }
}

#[async_trait::async_trait]
impl Model for MockModel {
    async fn complete(&self, request: CompletionRequest, _cancel_token: CancellationToken) -> Result<CompletionResponse, LlmError> {
        match self.next_response(&request).kind {
            ResponseKind::Complete(result) => result,
            ResponseKind::Interrupted { error, .. } => Err(error),
        }
    }

    fn stream(
        &self,
        request: CompletionRequest,
        _cancel_token: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send + 'static>> {
        let response = self.next_response(&request);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            response.send_stream(tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

#[derive(Debug, Clone)]
struct Inner {
    response_index: usize,
    mock_responses: Vec<MockResponse>,
    received_requests: Vec<CompletionRequest>,
}

impl Inner {
    fn new() -> Self {
        Self {
            response_index: 0,
            mock_responses: Vec::new(),
            received_requests: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::message::{
        StopReason,
        Usage,
    };

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: Some(text.to_string()),
            refusal: None,
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }

    fn empty_request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![],
            tools: None,
            output_schema: None,
            system_prompt: None,
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let model = MockModel::new().with_response(text_response("first")).with_response(text_response("second"));

        let first = model.complete(empty_request(), CancellationToken::new()).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("first"));

        let second = model.complete(empty_request(), CancellationToken::new()).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn stream_ends_with_done() {
        let model = MockModel::new().with_response(text_response("hello"));
        let mut stream = model.stream(empty_request(), CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    }

    #[tokio::test]
    #[should_panic(expected = "unexpected request")]
    async fn panics_when_exhausted() {
        let model = MockModel::new();
        let _ = model.complete(empty_request(), CancellationToken::new()).await;
    }
}
