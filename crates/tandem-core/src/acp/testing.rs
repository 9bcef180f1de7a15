//! In-memory external agent used by the ACP tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use super::client::AcpClient;
use super::protocol::AcpStopReason;
use super::registry::{AgentConnector, ClientSpec};
use super::transport::Transport;
use crate::error::AcpError;

pub(crate) struct ChannelTransport {
    to_agent: mpsc::UnboundedSender<String>,
    from_agent: Mutex<mpsc::UnboundedReceiver<String>>,
    alive: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &str) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.to_agent
            .send(message.to_string())
            .map_err(|_| anyhow!("fake agent gone"))
    }

    async fn receive(&self) -> Result<String> {
        self.from_agent
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("fake agent closed"))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// What the fake agent does for one `session/prompt`
#[derive(Clone)]
pub(crate) struct PromptScript {
    updates: Vec<Value>,
    stop_reason: AcpStopReason,
    request: Option<String>,
    wait_for_cancel: bool,
    error: Option<(i64, String)>,
    usage: Option<Value>,
}

impl PromptScript {
    pub(crate) fn new(stop_reason: AcpStopReason) -> Self {
        Self {
            updates: Vec::new(),
            stop_reason,
            request: None,
            wait_for_cancel: false,
            error: None,
            usage: None,
        }
    }

    pub(crate) fn update(mut self, update: Value) -> Self {
        self.updates.push(update);
        self
    }

    pub(crate) fn ask_permission(self) -> Self {
        self.ask("session/request_permission")
    }

    pub(crate) fn ask(mut self, method: &str) -> Self {
        self.request = Some(method.to_string());
        self
    }

    pub(crate) fn wait_for_cancel(mut self) -> Self {
        self.wait_for_cancel = true;
        self
    }

    pub(crate) fn fail(mut self, code: i64, message: &str) -> Self {
        self.error = Some((code, message.to_string()));
        self
    }

    pub(crate) fn usage(mut self, usage: Value) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeAgent {
    prompts: Vec<PromptScript>,
    silent: bool,
}

impl FakeAgent {
    pub(crate) fn prompt(mut self, script: PromptScript) -> Self {
        self.prompts.push(script);
        self
    }

    /// Never answers anything
    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Test-side view of a running fake agent
#[derive(Clone)]
pub(crate) struct FakeAgentHandle {
    log: Arc<Mutex<Vec<Value>>>,
    alive: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
}

impl FakeAgentHandle {
    /// Params of every client message with `method`
    pub(crate) async fn requests_for(&self, method: &str) -> Vec<Value> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .map(|m| m.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Client replies to agent-initiated requests
    pub(crate) async fn client_replies(&self) -> Vec<Value> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|m| m.get("method").is_none())
            .cloned()
            .collect()
    }

    /// Messages the client has written so far
    pub(crate) fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Simulate the agent process dying
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn spawn_fake_agent(agent: FakeAgent) -> (ChannelTransport, FakeAgentHandle) {
    let (to_agent, inbox) = mpsc::unbounded_channel();
    let (outbox, from_agent) = mpsc::unbounded_channel();
    let handle = FakeAgentHandle {
        log: Arc::new(Mutex::new(Vec::new())),
        alive: Arc::new(AtomicBool::new(true)),
        sent: Arc::new(AtomicUsize::new(0)),
    };

    tokio::spawn(run_agent(agent, inbox, outbox, Arc::clone(&handle.log)));

    let transport = ChannelTransport {
        to_agent,
        from_agent: Mutex::new(from_agent),
        alive: Arc::clone(&handle.alive),
        sent: Arc::clone(&handle.sent),
    };
    (transport, handle)
}

pub(crate) async fn started_client(agent: FakeAgent) -> (Arc<AcpClient>, FakeAgentHandle) {
    let (transport, handle) = spawn_fake_agent(agent);
    let client = AcpClient::start("fake", Arc::new(transport));
    (Arc::new(client), handle)
}

pub(crate) async fn connected_client(agent: FakeAgent) -> (Arc<AcpClient>, FakeAgentHandle) {
    let (client, handle) = started_client(agent).await;
    client.initialize(Duration::from_secs(5)).await.unwrap();
    (client, handle)
}

async fn run_agent(
    agent: FakeAgent,
    mut inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
    log: Arc<Mutex<Vec<Value>>>,
) {
    let mut prompts: VecDeque<PromptScript> = agent.prompts.into_iter().collect();
    let mut sessions = 0;

    let send = |message: Value| {
        let _ = outbox.send(message.to_string());
    };

    while let Some(line) = inbox.recv().await {
        let message: Value = serde_json::from_str(&line).unwrap();
        log.lock().await.push(message.clone());
        if agent.silent {
            continue;
        }

        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        match method.as_deref() {
            Some("initialize") => send(json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"protocolVersion": 1, "agentCapabilities": {}}
            })),
            Some("session/new") => {
                sessions += 1;
                send(json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"sessionId": format!("session-{}", sessions)}
                }));
            }
            Some("session/prompt") => {
                let session_id = message["params"]["sessionId"].clone();
                let script = prompts
                    .pop_front()
                    .unwrap_or_else(|| PromptScript::new(AcpStopReason::EndTurn));

                for update in script.updates {
                    send(json!({
                        "jsonrpc": "2.0",
                        "method": "session/update",
                        "params": {"sessionId": session_id, "update": update}
                    }));
                }

                if let Some(request) = script.request {
                    send(json!({
                        "jsonrpc": "2.0", "id": 900, "method": request,
                        "params": {
                            "sessionId": session_id,
                            "toolCall": {"toolCallId": "t-perm"},
                            "options": [
                                {"optionId": "allow-once", "name": "Allow once", "kind": "allow_once"},
                                {"optionId": "reject", "name": "Reject", "kind": "reject_once"}
                            ]
                        }
                    }));
                    wait_for(&mut inbox, &log, |m| m.get("method").is_none()).await;
                }

                let mut stop_reason = script.stop_reason;
                if script.wait_for_cancel {
                    wait_for(&mut inbox, &log, |m| {
                        m.get("method").and_then(Value::as_str) == Some("session/cancel")
                    })
                    .await;
                    stop_reason = AcpStopReason::Cancelled;
                }

                match script.error {
                    Some((code, text)) => send(json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": code, "message": text}
                    })),
                    None => {
                        let mut result = json!({"stopReason": stop_reason});
                        if let Some(usage) = script.usage {
                            result["usage"] = usage;
                        }
                        send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
                    }
                }
            }
            _ => {}
        }
    }
}

async fn wait_for(
    inbox: &mut mpsc::UnboundedReceiver<String>,
    log: &Mutex<Vec<Value>>,
    matches: impl Fn(&Value) -> bool,
) {
    while let Some(line) = inbox.recv().await {
        let message: Value = serde_json::from_str(&line).unwrap();
        log.lock().await.push(message.clone());
        if matches(&message) {
            return;
        }
    }
}

/// Connector that hands out fake agents and counts connections
pub(crate) struct FakeConnector {
    agent: FakeAgent,
    delay: Duration,
    connects: AtomicUsize,
    handles: Mutex<Vec<FakeAgentHandle>>,
}

impl FakeConnector {
    pub(crate) fn new(agent: FakeAgent) -> Self {
        Self {
            agent,
            delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) async fn handle(&self, index: usize) -> FakeAgentHandle {
        self.handles.lock().await[index].clone()
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self, _agent_name: &str, _spec: &ClientSpec) -> Result<Arc<AcpClient>, AcpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let (client, handle) = connected_client(self.agent.clone()).await;
        self.handles.lock().await.push(handle);
        Ok(client)
    }
}
