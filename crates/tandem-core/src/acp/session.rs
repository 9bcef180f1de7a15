//! External agent sessions
//!
//! A session is one conversation hosted by an external agent. Prompts stream
//! back as `SessionUpdate`s; the session keeps a message history built from
//! those updates so callers can fold the exchange into their own conversation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::client::AcpClient;
use super::protocol::AcpStopReason;
use super::registry::ClientEntry;
use crate::ai::types::{Message, ToolArgs, ToolCall, ToolCallStatus, Usage};
use crate::error::AcpError;

/// Incremental output of a prompt, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    MessageChunk {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: ToolArgs,
    },
    /// `content` is the accumulated output so far; `duration` is set once
    /// the call reaches a terminal status.
    ToolCallUpdate {
        id: String,
        status: ToolCallStatus,
        content: String,
        duration: Option<Duration>,
    },
}

/// Receives session updates while a prompt is in flight
#[async_trait]
pub trait UpdateHandler: Send {
    async fn on_update(&mut self, update: SessionUpdate);
}

#[async_trait]
impl<F> UpdateHandler for F
where
    F: FnMut(SessionUpdate) + Send,
{
    async fn on_update(&mut self, update: SessionUpdate) {
        self(update)
    }
}

/// How a prompt ended
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOutcome {
    pub stop_reason: AcpStopReason,
    pub usage: Usage,
    pub duration: Duration,
}

/// Rebuilds assistant/tool messages from a prompt's update stream
#[derive(Default)]
struct HistoryRecorder {
    messages: Vec<Message>,
    text: String,
    calls: Vec<ToolCall>,
    names: HashMap<String, String>,
}

impl HistoryRecorder {
    fn record(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::MessageChunk { text } => self.text.push_str(text),
            SessionUpdate::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.names.insert(id.clone(), name.clone());
                self.calls.push(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
            }
            SessionUpdate::ToolCallUpdate {
                id,
                status,
                content,
                ..
            } => {
                if *status == ToolCallStatus::Pending {
                    return;
                }
                self.flush_assistant();
                let name = self.names.get(id).cloned().unwrap_or_default();
                self.messages.push(Message::tool(id, name, content.clone()));
            }
        }
    }

    fn flush_assistant(&mut self) {
        if self.text.is_empty() && self.calls.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let calls = std::mem::take(&mut self.calls);
        self.messages.push(Message::assistant_with_tools(text, calls));
    }

    fn finish(mut self) -> Vec<Message> {
        self.flush_assistant();
        self.messages
    }
}

/// Records every update, then hands it to the caller's handler
struct Recording<'a> {
    recorder: HistoryRecorder,
    inner: &'a mut dyn UpdateHandler,
}

#[async_trait]
impl UpdateHandler for Recording<'_> {
    async fn on_update(&mut self, update: SessionUpdate) {
        self.recorder.record(&update);
        self.inner.on_update(update).await;
    }
}

/// One external-agent conversation
pub struct AcpSession {
    id: String,
    agent_name: String,
    client: Arc<AcpClient>,
    closed: AtomicBool,
    history: Mutex<Vec<Message>>,
    registry: Weak<RwLock<HashMap<String, ClientEntry>>>,
}

impl AcpSession {
    pub(crate) fn new(
        id: String,
        agent_name: String,
        client: Arc<AcpClient>,
        registry: Weak<RwLock<HashMap<String, ClientEntry>>>,
    ) -> Self {
        Self {
            id,
            agent_name,
            client,
            closed: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            registry,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a user prompt and stream updates to `handler` until the agent ends its turn.
    ///
    /// Cancelling `cancel` asks the agent to stop; the call still waits for
    /// the agent's final response, which normally reports `cancelled`.
    pub async fn send_prompt(
        &self,
        text: &str,
        cancel: &CancellationToken,
        handler: &mut dyn UpdateHandler,
    ) -> Result<PromptOutcome, AcpError> {
        if self.is_closed() {
            return Err(AcpError::SessionClosed(self.id.clone()));
        }

        self.history.lock().await.push(Message::user(text));

        let mut recording = Recording {
            recorder: HistoryRecorder::default(),
            inner: handler,
        };
        let result = self
            .client
            .prompt(&self.id, text, cancel, &mut recording)
            .await;

        let recorded = recording.recorder.finish();
        self.history.lock().await.extend(recorded);

        result
    }

    /// Messages exchanged so far, starting with the first prompt
    pub async fn get_messages(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Close the session and drop it from the registry. Idempotent.
    pub async fn close(&self) -> Result<(), AcpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut state = registry.write().await;
            if let Some(entry) = state.get_mut(&self.agent_name) {
                entry.sessions.remove(&self.id);
            }
        }
        self.client.unsubscribe(&self.id).await;

        tracing::debug!(agent = %self.agent_name, session = %self.id, "Closed external agent session");
        Ok(())
    }

    /// Mark closed without touching the registry; used when the registry drops the client.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpSession")
            .field("id", &self.id)
            .field("agent_name", &self.agent_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
