//! Owns the fleet of MCP server connections: launches them, applies
//! reconnection and health-check policy, routes `call_tool` with a timeout
//! race, and exposes the union of connected servers' tools as proxies.

pub mod connection;
pub mod proxy;
pub mod transport;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{
    Mutex,
    broadcast,
    mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

pub use self::proxy::{
    ToolFilter,
    ToolMode,
    ToolProxy,
};
pub use self::types::{
    Alert,
    ConnectionEvent,
    ConnectionSnapshot,
    ConnectionState,
    Prompt,
    ServerEvent,
    ServerSpec,
};
use self::connection::{
    McpConnectionHandle,
    McpServerConnection,
};
use crate::message::ToolSpec;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no server registered with id {0:?}")]
    UnknownServer(String),
    #[error("tool call to {server:?}/{tool:?} timed out after {timeout:?}")]
    ToolTimeout { server: String, tool: String, timeout: Duration },
    #[error("the call was cancelled")]
    Cancelled,
    #[error(transparent)]
    Connection(#[from] connection::ConnectionError),
}

/// Governs what happens after a connection transitions to `Failed`.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    None,
    Immediate { max_attempts: u32 },
    ExponentialBackoff { max_attempts: u32, base_delay: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    fn max_attempts(&self) -> Option<u32> {
        match self {
            ReconnectPolicy::None => Some(0),
            ReconnectPolicy::Immediate { max_attempts } => Some(*max_attempts),
            ReconnectPolicy::ExponentialBackoff { max_attempts, .. } => Some(*max_attempts),
        }
    }

    fn delay_for(&self, retry_count: u32) -> Duration {
        match self {
            ReconnectPolicy::None | ReconnectPolicy::Immediate { .. } => Duration::ZERO,
            ReconnectPolicy::ExponentialBackoff { base_delay, .. } => *base_delay * 2u32.saturating_pow(retry_count),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub reconnect_policy: ReconnectPolicy,
    pub default_call_timeout: Option<Duration>,
    pub health_check_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            reconnect_policy: ReconnectPolicy::default(),
            default_call_timeout: Some(Duration::from_secs(30)),
            health_check_interval: None,
        }
    }
}

struct ServerState {
    handle: McpConnectionHandle,
}

type Registry = Arc<Mutex<HashMap<String, ServerState>>>;

pub struct StartAllOutcome {
    pub connected: Vec<String>,
    pub failed: Vec<String>,
}

/// Fleet manager. Cheap to clone; clones share the same set of connections
/// and event plumbing.
#[derive(Clone)]
pub struct McpCoordinator {
    servers: Registry,
    config: Arc<CoordinatorConfig>,
    events_tx: broadcast::Sender<ServerEvent>,
    alerts_tx: broadcast::Sender<Alert>,
}

impl McpCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let (alerts_tx, _) = broadcast::channel(256);
        let coordinator = Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            events_tx,
            alerts_tx,
        };
        if let Some(interval) = coordinator.config.health_check_interval {
            coordinator.spawn_health_checks(interval);
        }
        coordinator
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts_tx.subscribe()
    }

    /// Registers and connects each spec concurrently; returns once every
    /// connect attempt has been dispatched, not once they complete. Use
    /// [`Self::start_all_and_wait`] to block until every connection reaches a
    /// terminal state.
    pub async fn start_all(&self, specs: HashMap<String, ServerSpec>) {
        let mut servers = self.servers.lock().await;
        for (server_id, spec) in specs {
            let mut handle = McpServerConnection::spawn(server_id.clone(), spec);
            let events_rx = handle.take_events();
            self.spawn_event_relay(server_id.clone(), events_rx);
            let _ = handle.connect().await;
            servers.insert(server_id, ServerState { handle });
        }
    }

    pub async fn start_all_and_wait(&self, specs: HashMap<String, ServerSpec>) -> StartAllOutcome {
        self.start_all(specs).await;
        let server_ids: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        let mut connected = Vec::new();
        let mut failed = Vec::new();
        for server_id in server_ids {
            loop {
                match self.connection_state(&server_id).await {
                    Some(state) if state.is_terminal() => {
                        if state.is_connected() {
                            connected.push(server_id);
                        } else {
                            failed.push(server_id);
                        }
                        break;
                    },
                    None => break,
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        }
        StartAllOutcome { connected, failed }
    }

    pub async fn reconnect(&self, server_id: &str) -> Result<(), CoordinatorError> {
        let servers = self.servers.lock().await;
        let state = servers.get(server_id).ok_or_else(|| CoordinatorError::UnknownServer(server_id.to_string()))?;
        state.handle.connect().await.map_err(CoordinatorError::from)
    }

    pub async fn disconnect(&self, server_id: &str) -> Result<(), CoordinatorError> {
        let servers = self.servers.lock().await;
        let state = servers.get(server_id).ok_or_else(|| CoordinatorError::UnknownServer(server_id.to_string()))?;
        state.handle.disconnect().await.map_err(CoordinatorError::from)
    }

    /// Tears down a server's connection; an alias for [`Self::disconnect`]
    /// kept as its own entry point since the host-facing reason for calling
    /// it ("give up on this server") differs from a routine disconnect.
    pub async fn cancel_connection(&self, server_id: &str) -> Result<(), CoordinatorError> {
        self.disconnect(server_id).await
    }

    /// Best-effort broadcast of a cancellation to every connection; only the
    /// one actually holding `request_id` does anything with it.
    pub async fn cancel_tool_call(&self, request_id: u64) {
        let servers = self.servers.lock().await;
        for state in servers.values() {
            state.handle.cancel_tool_call(request_id).await;
        }
    }

    /// Routes to the named connection with the given timeout (or the
    /// configured default); races the call against a sleep and cancels
    /// whichever side loses.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
        timeout: Option<Duration>,
        cancel_token: CancellationToken,
    ) -> Result<String, CoordinatorError> {
        let effective_timeout = timeout.or(self.config.default_call_timeout);
        let call_token = cancel_token.child_token();
        let handle = {
            let servers = self.servers.lock().await;
            let state = servers.get(server_id).ok_or_else(|| CoordinatorError::UnknownServer(server_id.to_string()))?;
            state.handle.clone()
        };
        let call = handle.call_tool(tool_name.to_string(), args, call_token.clone());

        match effective_timeout {
            Some(duration) => {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => {
                        call_token.cancel();
                        Err(CoordinatorError::Cancelled)
                    },
                    res = tokio::time::timeout(duration, call) => match res {
                        Ok(inner) => inner.map_err(CoordinatorError::from),
                        Err(_) => {
                            call_token.cancel();
                            let _ = self.alerts_tx.send(Alert::ToolTimedOut {
                                server: server_id.to_string(),
                                tool: tool_name.to_string(),
                            });
                            Err(CoordinatorError::ToolTimeout {
                                server: server_id.to_string(),
                                tool: tool_name.to_string(),
                                timeout: duration,
                            })
                        },
                    },
                }
            },
            None => {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => {
                        call_token.cancel();
                        Err(CoordinatorError::Cancelled)
                    },
                    res = call => res.map_err(CoordinatorError::from),
                }
            },
        }
    }

    /// Union of every `Connected` connection's tools matching `filter`; tools
    /// from non-`Connected` connections are omitted.
    pub async fn tools(&self, filter: &ToolFilter) -> Vec<(String, ToolSpec)> {
        let servers = self.servers.lock().await;
        let mut matched = Vec::new();
        for (server_id, state) in servers.iter() {
            if !state.handle.state().await.is_connected() {
                continue;
            }
            for spec in state.handle.tool_specs().await {
                if filter.matches(server_id, &spec.name) {
                    matched.push((server_id.clone(), spec));
                }
            }
        }
        matched
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let servers = self.servers.lock().await;
        let mut snapshots = Vec::with_capacity(servers.len());
        for (server_id, state) in servers.iter() {
            snapshots.push(ConnectionSnapshot {
                server_id: server_id.clone(),
                state: state.handle.state().await,
                tools: state.handle.tool_specs().await,
            });
        }
        snapshots
    }

    async fn connection_state(&self, server_id: &str) -> Option<ConnectionState> {
        let servers = self.servers.lock().await;
        match servers.get(server_id) {
            Some(state) => Some(state.handle.state().await),
            None => None,
        }
    }

    fn spawn_event_relay(&self, server_id: String, mut events_rx: mpsc::Receiver<ConnectionEvent>) {
        let events_tx = self.events_tx.clone();
        let alerts_tx = self.alerts_tx.clone();
        let reconnect_policy = self.config.reconnect_policy.clone();
        let servers = Arc::clone(&self.servers);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let ConnectionEvent::StateChanged { to: ConnectionState::Failed { retry_count }, .. } = &event {
                    handle_failure(&servers, &reconnect_policy, &alerts_tx, &server_id, *retry_count).await;
                }
                let _ = events_tx.send(ServerEvent {
                    server_id: server_id.clone(),
                    event,
                });
            }
        });
    }

    fn spawn_health_checks(&self, interval: Duration) {
        let servers = Arc::clone(&self.servers);
        let alerts_tx = self.alerts_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let connected_ids: Vec<String> = {
                    let mut ids = Vec::new();
                    let guard = servers.lock().await;
                    for (server_id, state) in guard.iter() {
                        if state.handle.state().await.is_connected() {
                            ids.push(server_id.clone());
                        }
                    }
                    ids
                };
                for server_id in connected_ids {
                    let healthy = {
                        let guard = servers.lock().await;
                        match guard.get(&server_id) {
                            Some(state) => connection::probe(&state.handle, Duration::from_secs(5)).await,
                            None => continue,
                        }
                    };
                    if healthy {
                        continue;
                    }
                    warn!(%server_id, "health check failed, disconnecting");
                    let guard = servers.lock().await;
                    if let Some(state) = guard.get(&server_id) {
                        let _ = state.handle.disconnect().await;
                    }
                    let _ = alerts_tx.send(Alert::ServerUnhealthy {
                        server_id: server_id.clone(),
                        reason: "health check probe failed".to_string(),
                    });
                }
            }
        });
    }
}

async fn handle_failure(
    servers: &Registry,
    policy: &ReconnectPolicy,
    alerts_tx: &broadcast::Sender<Alert>,
    server_id: &str,
    retry_count: u32,
) {
    let _ = alerts_tx.send(Alert::ConnectionFailed { server_id: server_id.to_string() });

    let max_attempts = policy.max_attempts();
    let permitted = max_attempts.is_none_or(|max| retry_count < max);
    if !permitted {
        let _ = alerts_tx.send(Alert::ConnectionLost { server_id: server_id.to_string() });
        return;
    }

    let delay = policy.delay_for(retry_count);
    let _ = alerts_tx.send(Alert::Reconnecting {
        server_id: server_id.to_string(),
        attempt: retry_count + 1,
        max_attempts,
    });

    let servers = Arc::clone(servers);
    let server_id = server_id.to_string();
    let alerts_tx = alerts_tx.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let guard = servers.lock().await;
        if let Some(state) = guard.get(&server_id) {
            debug!(%server_id, "dispatching reconnect attempt");
            if state.handle.connect().await.is_ok() {
                let _ = alerts_tx.send(Alert::Reconnected { server_id: server_id.clone() });
            }
        }
    });
}
