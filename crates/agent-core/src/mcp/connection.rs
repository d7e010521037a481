//! A single-writer actor owning one MCP client. Implements the state machine
//! from the coordinator's point of view: `connect`/`disconnect`/`call_tool`
//! plus a lazy event sequence of state transitions, log lines, and per-call
//! lifecycle notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use serde_json::Value;
use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use super::transport::{
    self,
    NoCallbackRouter,
    OAuthCallbackRouter,
    RunningMcpClient,
    TransportError,
    TransportMessage,
};
use super::types::{
    ConnectionEvent,
    ConnectionState,
    LogEntry,
    LogLevel,
    Prompt,
    ServerSpec,
};
use crate::message::ToolSpec;

const LOG_RETENTION: usize = 1000;

/// One call against the connection actor, paired with the `oneshot` its
/// result comes back on. The actor's `main_loop` owns the receiving half;
/// every public `McpConnectionHandle` method sends one of these and awaits
/// the reply.
struct ConnectionCall {
    request: ConnectionRequest,
    reply: oneshot::Sender<Result<ConnectionResponse, ConnectionError>>,
}

/// Sending half held by [`McpConnectionHandle`]. Cheap to clone: every call
/// shares the same `mpsc` into the actor and gets its own one-shot reply
/// slot.
#[derive(Clone)]
pub(crate) struct ConnectionCallSender {
    tx: mpsc::Sender<ConnectionCall>,
}

impl ConnectionCallSender {
    /// `None` means the actor's receive loop has already exited — every
    /// outstanding or future call on a dead connection resolves this way
    /// rather than hanging.
    async fn send_recv(&self, request: ConnectionRequest) -> Option<Result<ConnectionResponse, ConnectionError>> {
        let (reply, reply_rx) = oneshot::channel();
        if self.tx.send(ConnectionCall { request, reply }).await.is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    pub(crate) async fn call_tool(
        &self,
        name: String,
        args: Option<serde_json::Map<String, Value>>,
        cancel_token: CancellationToken,
    ) -> Result<String, ConnectionError> {
        match self
            .send_recv(ConnectionRequest::CallTool { name, args, cancel_token })
            .await
            .unwrap_or(Err(ConnectionError::Channel))?
        {
            ConnectionResponse::ToolResult(s) => Ok(s),
            _ => Err(ConnectionError::Channel),
        }
    }
}

fn new_connection_channel() -> (ConnectionCallSender, mpsc::Receiver<ConnectionCall>) {
    let (tx, rx) = mpsc::channel(16);
    (ConnectionCallSender { tx }, rx)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is not in the Connected state")]
    NotConnected,
    #[error("server disconnected while the call was in flight")]
    ServerDisconnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("the connection actor has shut down")]
    Channel,
}

#[derive(Debug)]
enum ConnectionRequest {
    Connect,
    Disconnect,
    CallTool { name: String, args: Option<serde_json::Map<String, Value>>, cancel_token: CancellationToken },
    CancelToolCall { request_id: u64 },
    GetState,
    GetToolSpecs,
    GetPrompts,
}

#[derive(Debug)]
enum ConnectionResponse {
    Ack,
    ToolResult(String),
    State(ConnectionState),
    ToolSpecs(Vec<ToolSpec>),
    Prompts(Vec<Prompt>),
}

pub struct McpConnectionHandle {
    pub server_id: String,
    sender: ConnectionCallSender,
    events: mpsc::Receiver<ConnectionEvent>,
}

impl McpConnectionHandle {
    pub async fn events(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Takes ownership of this handle's event stream, leaving a closed
    /// receiver in its place. Used once at registration time by a fleet
    /// manager that wants to relay events on a dedicated task while every
    /// other method (`connect`, `call_tool`, ...) keeps working through `&self`.
    pub fn take_events(&mut self) -> mpsc::Receiver<ConnectionEvent> {
        let (_tx, rx) = mpsc::channel(1);
        std::mem::replace(&mut self.events, rx)
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.sender.send_recv(ConnectionRequest::Connect).await.unwrap_or(Err(ConnectionError::Channel))?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.sender.send_recv(ConnectionRequest::Disconnect).await.unwrap_or(Err(ConnectionError::Channel))?;
        Ok(())
    }

    pub async fn call_tool(
        &self,
        name: String,
        args: Option<serde_json::Map<String, Value>>,
        cancel_token: CancellationToken,
    ) -> Result<String, ConnectionError> {
        self.sender.call_tool(name, args, cancel_token).await
    }

    /// Returns a cheaply-cloned, owned handle to this connection's call
    /// channel so a caller can issue a call without holding a borrow on
    /// the `McpConnectionHandle` itself (e.g. across a lock guard's scope).
    pub(crate) fn call_sender(&self) -> ConnectionCallSender {
        self.sender.clone()
    }

    pub async fn cancel_tool_call(&self, request_id: u64) {
        let _ = self.sender.send_recv(ConnectionRequest::CancelToolCall { request_id }).await;
    }

    pub async fn state(&self) -> ConnectionState {
        match self.sender.send_recv(ConnectionRequest::GetState).await {
            Some(Ok(ConnectionResponse::State(s))) => s,
            _ => ConnectionState::Failed { retry_count: 0 },
        }
    }

    pub async fn tool_specs(&self) -> Vec<ToolSpec> {
        match self.sender.send_recv(ConnectionRequest::GetToolSpecs).await {
            Some(Ok(ConnectionResponse::ToolSpecs(v))) => v,
            _ => Vec::new(),
        }
    }

    pub async fn prompts(&self) -> Vec<Prompt> {
        match self.sender.send_recv(ConnectionRequest::GetPrompts).await {
            Some(Ok(ConnectionResponse::Prompts(v))) => v,
            _ => Vec::new(),
        }
    }
}

enum Internal {
    Connected { client: RunningMcpClient, tools: Vec<ToolSpec>, prompts: Vec<Prompt> },
    ConnectFailed(TransportError),
    Transport(TransportMessage),
    CallFinished { request_id: u64, result: Result<String, ConnectionError> },
}

struct PendingCall {
    tool_name: String,
    started_at: Instant,
    cancel_token: CancellationToken,
    reply: oneshot::Sender<Result<String, ConnectionError>>,
}

pub struct McpServerConnection {
    server_id: String,
    spec: ServerSpec,
    state: ConnectionState,
    tools: Vec<ToolSpec>,
    prompts: Vec<Prompt>,
    client: Option<RunningMcpClient>,

    curr_request_id: u64,
    pending_calls: HashMap<u64, PendingCall>,

    req_rx: mpsc::Receiver<ConnectionCall>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    logs: std::collections::VecDeque<LogEntry>,

    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
}

impl McpServerConnection {
    pub fn spawn(server_id: String, spec: ServerSpec) -> McpConnectionHandle {
        let (req_tx, req_rx) = new_connection_channel();
        let (events_tx, events_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let connection = Self {
            server_id: server_id.clone(),
            spec,
            state: ConnectionState::Idle,
            tools: Vec::new(),
            prompts: Vec::new(),
            client: None,
            curr_request_id: 0,
            pending_calls: HashMap::new(),
            req_rx,
            events_tx,
            logs: std::collections::VecDeque::new(),
            internal_tx,
            internal_rx,
        };
        tokio::spawn(connection.main_loop());

        McpConnectionHandle {
            server_id,
            sender: req_tx,
            events: events_rx,
        }
    }

    async fn main_loop(mut self) {
        loop {
            tokio::select! {
                call = self.req_rx.recv() => {
                    let Some(call) = call else {
                        warn!(server_id = %self.server_id, "connection request channel closed, exiting");
                        break;
                    };
                    let res = self.handle_request(call.request).await;
                    let _ = call.reply.send(res);
                },
                msg = self.internal_rx.recv() => {
                    let Some(msg) = msg else { continue };
                    self.handle_internal(msg).await;
                },
            }
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state.clone();
        if from == to {
            return;
        }
        if matches!(from, ConnectionState::Connected) && !matches!(to, ConnectionState::Connected) {
            for (request_id, pending) in self.pending_calls.drain() {
                pending.cancel_token.cancel();
                let _ = pending.reply.send(Err(ConnectionError::ServerDisconnected));
                let _ = self.events_tx.try_send(ConnectionEvent::ToolCallCancelled {
                    request_id,
                    tool_name: pending.tool_name,
                });
            }
            self.client = None;
            self.tools.clear();
        }
        self.state = to.clone();
        let _ = self.events_tx.try_send(ConnectionEvent::StateChanged { from, to });
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if self.logs.len() >= LOG_RETENTION {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry { level, message: message.clone() });
        let _ = self.events_tx.try_send(ConnectionEvent::Log(LogEntry { level, message }));
    }

    async fn handle_request(&mut self, req: ConnectionRequest) -> Result<ConnectionResponse, ConnectionError> {
        match req {
            ConnectionRequest::Connect => {
                self.begin_connect();
                Ok(ConnectionResponse::Ack)
            },
            ConnectionRequest::Disconnect => {
                if matches!(self.state, ConnectionState::Connected) {
                    self.transition(ConnectionState::Disconnected);
                }
                Ok(ConnectionResponse::Ack)
            },
            ConnectionRequest::CallTool { name, args, cancel_token } => {
                self.start_tool_call(name, args, cancel_token).await.map(ConnectionResponse::ToolResult)
            },
            ConnectionRequest::CancelToolCall { request_id } => {
                if let Some(pending) = self.pending_calls.get(&request_id) {
                    pending.cancel_token.cancel();
                    if let Some(client) = &self.client {
                        client.send_cancellation(request_id).await;
                    }
                }
                Ok(ConnectionResponse::Ack)
            },
            ConnectionRequest::GetState => Ok(ConnectionResponse::State(self.state.clone())),
            ConnectionRequest::GetToolSpecs => Ok(ConnectionResponse::ToolSpecs(self.tools.clone())),
            ConnectionRequest::GetPrompts => Ok(ConnectionResponse::Prompts(self.prompts.clone())),
        }
    }

    /// Idempotent from `Idle | Failed | Disconnected`; a no-op while a
    /// connect attempt is already in flight or already `Connected`.
    fn begin_connect(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Failed { .. } | ConnectionState::Disconnected
        ) {
            return;
        }
        self.transition(ConnectionState::Connecting);
        if matches!(self.spec, ServerSpec::OAuth { .. }) {
            self.transition(ConnectionState::Authenticating);
        }

        let spec = self.spec.clone();
        let server_id = self.server_id.clone();
        let internal_tx = self.internal_tx.clone();
        let (message_tx, mut message_rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(msg) = message_rx.recv().await {
                let _ = internal_tx.send(Internal::Transport(msg)).await;
            }
        });
        let internal_tx2 = self.internal_tx.clone();
        tokio::spawn(async move {
            let router: &dyn OAuthCallbackRouter = &NoCallbackRouter;
            match transport::launch(server_id, spec, router, message_tx).await {
                Ok((client, metadata)) => {
                    let _ = internal_tx2
                        .send(Internal::Connected {
                            client,
                            tools: metadata.tools,
                            prompts: metadata.prompts,
                        })
                        .await;
                },
                Err(e) => {
                    let _ = internal_tx2.send(Internal::ConnectFailed(e)).await;
                },
            }
        });
    }

    async fn start_tool_call(
        &mut self,
        name: String,
        args: Option<serde_json::Map<String, Value>>,
        cancel_token: CancellationToken,
    ) -> Result<String, ConnectionError> {
        let Some(client) = self.client.clone() else {
            return Err(ConnectionError::NotConnected);
        };
        self.curr_request_id += 1;
        let request_id = self.curr_request_id;
        let _ = self.events_tx.try_send(ConnectionEvent::ToolCallStarted {
            request_id,
            tool_name: name.clone(),
        });

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_calls.insert(request_id, PendingCall {
            tool_name: name.clone(),
            started_at: Instant::now(),
            cancel_token: cancel_token.clone(),
            reply: reply_tx,
        });

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => Err(ConnectionError::ServerDisconnected),
                res = client.call_tool(&name, args) => res.map_err(ConnectionError::from),
            };
            let _ = internal_tx.send(Internal::CallFinished { request_id, result }).await;
        });

        reply_rx.await.map_err(|_| ConnectionError::Channel)?
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { client, tools, prompts } => {
                self.client = Some(client);
                self.tools = tools;
                self.prompts = prompts;
                self.transition(ConnectionState::Connected);
            },
            Internal::ConnectFailed(err) => {
                self.push_log(LogLevel::Error, format!("connect failed: {err}"));
                self.transition(ConnectionState::Failed { retry_count: 0 });
            },
            Internal::Transport(TransportMessage::ToolListChanged(Ok(tools))) => {
                self.tools = tools.into_iter().map(Into::into).collect();
            },
            Internal::Transport(TransportMessage::ToolListChanged(Err(e))) => {
                self.push_log(LogLevel::Error, format!("failed to refresh tools: {e}"));
            },
            Internal::Transport(TransportMessage::PromptListChanged(Ok(prompts))) => {
                self.prompts = prompts.into_iter().map(Into::into).collect();
            },
            Internal::Transport(TransportMessage::PromptListChanged(Err(e))) => {
                self.push_log(LogLevel::Error, format!("failed to refresh prompts: {e}"));
            },
            Internal::Transport(TransportMessage::Log { level, data }) => {
                let level = match level {
                    rmcp::model::LoggingLevel::Error | rmcp::model::LoggingLevel::Critical | rmcp::model::LoggingLevel::Emergency | rmcp::model::LoggingLevel::Alert => LogLevel::Error,
                    rmcp::model::LoggingLevel::Warning => LogLevel::Warning,
                    rmcp::model::LoggingLevel::Info | rmcp::model::LoggingLevel::Notice => LogLevel::Info,
                    rmcp::model::LoggingLevel::Debug => LogLevel::Debug,
                };
                self.push_log(level, data);
            },
            Internal::CallFinished { request_id, result } => {
                let Some(pending) = self.pending_calls.remove(&request_id) else {
                    debug!(request_id, "call finished for an already-resolved request");
                    return;
                };
                let duration = pending.started_at.elapsed();
                let _ = self.events_tx.try_send(ConnectionEvent::ToolCallCompleted {
                    request_id,
                    tool_name: pending.tool_name.clone(),
                    duration,
                });
                let _ = pending.reply.send(result);
            },
        }
    }
}

/// Probes liveness of a `Connected` connection for the coordinator's health
/// check loop: a trivial tool list round trip with a short timeout.
pub async fn probe(handle: &McpConnectionHandle, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, handle.tool_specs()).await.is_ok()
}
