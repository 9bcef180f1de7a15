//! ACP client for one external agent process
//!
//! Handles JSON-RPC communication with a single agent. A background receive
//! loop resolves pending requests, routes `session/update` notifications to
//! the prompt that is waiting on them, and answers agent-initiated requests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    auto_permission_outcome, raw_input_args, tool_content_text, CancelParams, ClientCapabilities,
    ContentBlock, IncomingMessage, InitializeParams, InitializeResult, McpServerParam,
    NewSessionParams, NewSessionResult, PermissionRequest, PromptParams, PromptResult, RpcErrorBody,
    RpcNotification, RpcReply, RpcRequest, SessionNotification, WireSessionUpdate,
    METHOD_INITIALIZE, METHOD_NOT_FOUND, METHOD_REQUEST_PERMISSION, METHOD_SESSION_CANCEL,
    METHOD_SESSION_NEW, METHOD_SESSION_PROMPT, METHOD_SESSION_UPDATE, PROTOCOL_VERSION,
};
use super::session::{PromptOutcome, SessionUpdate, UpdateHandler};
use super::transport::Transport;
use crate::agent::config::ToolServerSpec;
use crate::ai::types::{ToolCallStatus, Usage};
use crate::error::AcpError;

/// Bound on requests other than `initialize` and `session/prompt`
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value, AcpError>>>>>;
type Subscribers = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<WireSessionUpdate>>>>;

/// Client for one external agent
pub struct AcpClient {
    agent_name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: PendingMap,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl AcpClient {
    /// Start the receive loop over an already-open transport.
    ///
    /// Call [`AcpClient::initialize`] before creating sessions.
    pub fn start(agent_name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let agent_name = agent_name.into();
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let inbound = Inbound {
            agent_name: agent_name.clone(),
            transport: Arc::clone(&transport),
            pending: Arc::clone(&pending),
            subscribers: Arc::clone(&subscribers),
        };
        let loop_connected = Arc::clone(&connected);
        let loop_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_shutdown.cancelled() => {
                        debug!(agent = %inbound.agent_name, "Receive loop shutting down");
                        break;
                    }
                    result = inbound.transport.receive() => {
                        match result {
                            Ok(message) => {
                                if let Err(e) = inbound.handle(&message).await {
                                    warn!(agent = %inbound.agent_name, error = %e, "Bad message from external agent");
                                }
                            }
                            Err(e) => {
                                error!(agent = %inbound.agent_name, error = %e, "External agent connection lost");
                                break;
                            }
                        }
                    }
                }
            }
            loop_connected.store(false, Ordering::SeqCst);
            inbound.fail_all().await;
        });

        Self {
            agent_name,
            transport,
            next_id: AtomicI64::new(1),
            pending,
            subscribers,
            connected,
            shutdown,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Protocol handshake, bounded by `timeout`
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, AcpError> {
        info!(agent = %self.agent_name, "Initializing external agent");
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities::default(),
        };
        let result: InitializeResult = self
            .request(METHOD_INITIALIZE, &params, Some((METHOD_INITIALIZE, timeout)))
            .await?;
        info!(
            agent = %self.agent_name,
            protocol_version = result.protocol_version,
            "External agent initialized"
        );
        Ok(result)
    }

    /// Open a session rooted at `cwd`, handing the agent our tool servers
    pub async fn new_session(
        &self,
        cwd: &Path,
        tool_servers: &[ToolServerSpec],
    ) -> Result<String, AcpError> {
        let params = NewSessionParams {
            cwd: cwd.to_path_buf(),
            mcp_servers: tool_servers.iter().map(McpServerParam::from).collect(),
        };
        let result: NewSessionResult = self
            .request(
                METHOD_SESSION_NEW,
                &params,
                Some((METHOD_SESSION_NEW, self.request_timeout)),
            )
            .await?;
        debug!(agent = %self.agent_name, session = %result.session_id, "Created external agent session");
        Ok(result.session_id)
    }

    /// Run one prompt, forwarding updates in arrival order until the agent answers.
    pub(crate) async fn prompt(
        &self,
        session_id: &str,
        text: &str,
        cancel: &CancellationToken,
        handler: &mut dyn UpdateHandler,
    ) -> Result<PromptOutcome, AcpError> {
        let started = Instant::now();
        let (tx, mut updates) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .insert(session_id.to_string(), tx);

        let params = PromptParams {
            session_id: session_id.to_string(),
            prompt: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        };

        let outcome = match self.begin_request(METHOD_SESSION_PROMPT, &params).await {
            Ok((_, mut response)) => {
                let mut timings: HashMap<String, Instant> = HashMap::new();
                let mut cancel_sent = false;

                let reply = loop {
                    tokio::select! {
                        biased;
                        Some(update) = updates.recv() => {
                            for update in convert_update(update, &mut timings) {
                                handler.on_update(update).await;
                            }
                        }
                        reply = &mut response => break reply,
                        _ = cancel.cancelled(), if !cancel_sent => {
                            cancel_sent = true;
                            info!(agent = %self.agent_name, session = %session_id, "Cancelling external agent prompt");
                            let params = CancelParams { session_id: session_id.to_string() };
                            if let Err(e) = self.notify(METHOD_SESSION_CANCEL, &params).await {
                                warn!(agent = %self.agent_name, error = %e, "Failed to send session/cancel");
                            }
                        }
                    }
                };

                while let Ok(update) = updates.try_recv() {
                    for update in convert_update(update, &mut timings) {
                        handler.on_update(update).await;
                    }
                }

                match reply {
                    Ok(Ok(value)) => serde_json::from_value::<PromptResult>(value)
                        .map_err(AcpError::from)
                        .map(|result| PromptOutcome {
                            stop_reason: result.stop_reason,
                            usage: result
                                .usage
                                .map(|u| Usage {
                                    prompt_tokens: u.input_tokens,
                                    completion_tokens: u.output_tokens,
                                    cached_tokens: u.cached_read_tokens,
                                    total_tokens: u.total_tokens,
                                })
                                .unwrap_or_default(),
                            duration: started.elapsed(),
                        }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AcpError::ConnectionClosed),
                }
            }
            Err(e) => Err(e),
        };

        self.unsubscribe(session_id).await;
        outcome
    }

    /// Live process and a running receive loop
    pub async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_alive().await
    }

    /// Stop the receive loop and terminate the agent process
    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) && self.shutdown.is_cancelled() {
            return;
        }
        info!(agent = %self.agent_name, "Closing external agent client");
        self.shutdown.cancel();
        self.transport.close().await;

        let mut pending = self.pending.write().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(AcpError::ConnectionClosed));
        }
        drop(pending);
        self.subscribers.write().await.clear();
    }

    pub(crate) async fn unsubscribe(&self, session_id: &str) {
        self.subscribers.write().await.remove(session_id);
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<(&'static str, Duration)>,
    ) -> Result<R, AcpError> {
        let (id, rx) = self.begin_request(method, params).await?;

        let reply = match timeout {
            Some((operation, limit)) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.write().await.remove(&id);
                    return Err(AcpError::Timeout {
                        operation,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AcpError::ConnectionClosed),
        }
    }

    /// Register a pending slot and write the request
    async fn begin_request<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(i64, oneshot::Receiver<Result<Value, AcpError>>), AcpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AcpError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id, method, Some(serde_json::to_value(params)?));
        let json = serde_json::to_string(&request)?;

        debug!(agent = %self.agent_name, id, method, "ACP request");

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        if let Err(e) = self.transport.send(&json).await {
            self.pending.write().await.remove(&id);
            warn!(agent = %self.agent_name, error = %e, "Failed to write ACP request");
            return Err(AcpError::ConnectionClosed);
        }

        Ok((id, rx))
    }

    async fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<(), AcpError> {
        let notification = RpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: Some(serde_json::to_value(params)?),
        };
        let json = serde_json::to_string(&notification)?;
        debug!(agent = %self.agent_name, method, "ACP notify");
        self.transport
            .send(&json)
            .await
            .map_err(|_| AcpError::ConnectionClosed)
    }
}

impl Drop for AcpClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State owned by the receive loop
struct Inbound {
    agent_name: String,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    subscribers: Subscribers,
}

impl Inbound {
    async fn handle(&self, message: &str) -> Result<(), AcpError> {
        let message: IncomingMessage = serde_json::from_str(message)?;

        match (message.id, message.method) {
            (Some(id), Some(method)) => self.answer(id, &method, message.params).await,
            (None, Some(method)) => {
                self.route(&method, message.params).await;
                Ok(())
            }
            (Some(id), None) => {
                self.resolve(id, message.result, message.error).await;
                Ok(())
            }
            (None, None) => Err(AcpError::Protocol(
                "message has neither id nor method".to_string(),
            )),
        }
    }

    async fn resolve(&self, id: Value, result: Option<Value>, error: Option<RpcErrorBody>) {
        let Some(id) = id.as_i64() else {
            warn!(agent = %self.agent_name, ?id, "Response with non-numeric id");
            return;
        };

        let Some(tx) = self.pending.write().await.remove(&id) else {
            debug!(agent = %self.agent_name, id, "Response for unknown request");
            return;
        };

        let reply = match error {
            Some(error) => Err(AcpError::Rpc {
                code: error.code,
                message: error.message,
            }),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
    }

    async fn route(&self, method: &str, params: Option<Value>) {
        if method != METHOD_SESSION_UPDATE {
            debug!(agent = %self.agent_name, method, "Ignoring notification");
            return;
        }

        let notification: SessionNotification =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(n) => n,
                Err(e) => {
                    warn!(agent = %self.agent_name, error = %e, "Malformed session/update");
                    return;
                }
            };

        let subscribers = self.subscribers.read().await;
        match subscribers.get(&notification.session_id) {
            Some(tx) => {
                let _ = tx.send(notification.update);
            }
            None => debug!(
                agent = %self.agent_name,
                session = %notification.session_id,
                "Update for session with no prompt in flight"
            ),
        }
    }

    /// Reply to a request the agent sent us
    async fn answer(&self, id: Value, method: &str, params: Option<Value>) -> Result<(), AcpError> {
        let reply = if method == METHOD_REQUEST_PERMISSION {
            let request: PermissionRequest =
                serde_json::from_value(params.unwrap_or(Value::Null))?;
            debug!(
                agent = %self.agent_name,
                options = request.options.len(),
                "Auto-approving permission request"
            );
            RpcReply::result(id, auto_permission_outcome(&request))
        } else {
            debug!(agent = %self.agent_name, method, "Rejecting unsupported agent request");
            RpcReply::error(id, METHOD_NOT_FOUND, format!("method not found: {}", method))
        };

        let json = serde_json::to_string(&reply)?;
        self.transport
            .send(&json)
            .await
            .map_err(|_| AcpError::ConnectionClosed)
    }

    async fn fail_all(&self) {
        let mut pending = self.pending.write().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(AcpError::ConnectionClosed));
        }
        drop(pending);
        self.subscribers.write().await.clear();
    }
}

/// Map one wire update to session updates, timing tool calls per prompt.
/// A tool call announced as already finished also yields its terminal update.
fn convert_update(
    update: WireSessionUpdate,
    timings: &mut HashMap<String, Instant>,
) -> Vec<SessionUpdate> {
    match update {
        WireSessionUpdate::AgentMessageChunk { content } => match content.as_text() {
            Some(text) if !text.is_empty() => vec![SessionUpdate::MessageChunk {
                text: text.to_string(),
            }],
            _ => Vec::new(),
        },
        WireSessionUpdate::ToolCall {
            tool_call_id,
            title,
            status,
            raw_input,
            content,
        } => {
            let status = status.map(ToolCallStatus::from).unwrap_or(ToolCallStatus::Pending);
            let mut updates = vec![SessionUpdate::ToolCall {
                id: tool_call_id.clone(),
                name: title,
                arguments: raw_input_args(raw_input),
            }];
            if status == ToolCallStatus::Pending {
                timings.insert(tool_call_id, Instant::now());
            } else {
                updates.push(SessionUpdate::ToolCallUpdate {
                    id: tool_call_id,
                    status,
                    content: content.map(|c| tool_content_text(&c)).unwrap_or_default(),
                    duration: Some(Duration::ZERO),
                });
            }
            updates
        }
        WireSessionUpdate::ToolCallUpdate {
            tool_call_id,
            status,
            content,
        } => {
            let status = status.map(ToolCallStatus::from).unwrap_or(ToolCallStatus::Pending);
            let duration = match status {
                ToolCallStatus::Pending => None,
                _ => timings.remove(&tool_call_id).map(|t| t.elapsed()),
            };
            vec![SessionUpdate::ToolCallUpdate {
                id: tool_call_id,
                status,
                content: content.map(|c| tool_content_text(&c)).unwrap_or_default(),
                duration,
            }]
        }
        WireSessionUpdate::Ignored => Vec::new(),
    }
}
