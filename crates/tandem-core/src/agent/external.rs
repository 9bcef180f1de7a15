//! Delegating a whole turn to an external agent
//!
//! One session is opened per invocation and always closed afterwards. The
//! agent's streamed updates are re-emitted as loop events so listeners see
//! the same event names whether the loop or the external agent did the work.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::config::{AgentConfig, ExternalAgentConfig};
use super::events::AgentEvent;
use super::orchestrator::{last_user_text, Interrupted};
use crate::acp::{AcpStopReason, ClientRegistry, ClientSpec, SessionUpdate, UpdateHandler};
use crate::ai::types::{Message, Role, ToolArgs, ToolCall, ToolCallStatus, ToolCallUpdate, Usage};
use crate::error::AgentError;

/// Bridges session updates onto the event bus
struct Forwarder<'a> {
    bus: &'a EventBus,
    calls: HashMap<String, (String, ToolArgs)>,
}

#[async_trait]
impl UpdateHandler for Forwarder<'_> {
    async fn on_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::MessageChunk { text } => {
                self.bus.callbacks().on_chunk(&text).await;
                self.bus.emit(&AgentEvent::Chunk { content: text }).await;
            }
            SessionUpdate::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.bus.callbacks().on_tool_call_start(&id, &name).await;
                self.calls
                    .insert(id.clone(), (name.clone(), arguments.clone()));
                // the external agent runs its own tools; overrides cannot apply
                self.bus
                    .emit(&AgentEvent::ToolStart {
                        call: ToolCall {
                            id,
                            name,
                            arguments,
                        },
                    })
                    .await;
            }
            SessionUpdate::ToolCallUpdate {
                id,
                status,
                content,
                duration,
            } => {
                if status == ToolCallStatus::Pending {
                    return;
                }
                let (name, arguments) = self.calls.remove(&id).unwrap_or_default();
                let (output, error) = match status {
                    ToolCallStatus::Failed => (None, Some(content)),
                    _ => (Some(content), None),
                };
                self.bus
                    .emit(&AgentEvent::ToolEnd {
                        update: ToolCallUpdate {
                            id,
                            name,
                            arguments,
                            status,
                            duration,
                            output,
                            error,
                        },
                    })
                    .await;
            }
        }
    }
}

/// Run one turn on the external agent configured for `agent`
pub(super) async fn run_external(
    registry: &ClientRegistry,
    conversation: Vec<Message>,
    agent: &AgentConfig,
    external: &ExternalAgentConfig,
    bus: &EventBus,
    cancel: &CancellationToken,
    usage: &mut Usage,
) -> Result<Vec<Message>, Interrupted> {
    if cancel.is_cancelled() {
        return Err(Interrupted::with(AgentError::Cancelled, conversation));
    }

    let Some(prompt) = last_user_text(&conversation).map(str::to_string) else {
        return Err(Interrupted::bare(AgentError::config(
            &agent.name,
            "external agent needs a user message to send",
        )));
    };

    bus.emit(&AgentEvent::IterationStart { iteration: 1 }).await;

    let spec = ClientSpec::from(external);
    let client = registry
        .get_or_create_client(&agent.name, &spec)
        .await
        .map_err(|e| Interrupted::with(e.into(), conversation.clone()))?;

    let cwd = match &external.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| ".".into()),
    };
    let session = registry
        .new_session(&agent.name, &client, &cwd, &external.tool_servers)
        .await
        .map_err(|e| Interrupted::with(e.into(), conversation.clone()))?;

    debug!(agent = %agent.name, session = %session.session_id(), "Delegating turn to external agent");

    let mut forwarder = Forwarder {
        bus,
        calls: HashMap::new(),
    };
    let sent = session.send_prompt(&prompt, cancel, &mut forwarder).await;
    let history = session.get_messages().await;
    if let Err(e) = registry.close_session(&session).await {
        warn!(agent = %agent.name, error = %e, "Failed to close external agent session");
    }

    let mut messages = conversation;
    // the session history opens with the prompt we just sent
    let mut replies = history.into_iter().peekable();
    if replies.peek().map(|m| m.role) == Some(Role::User) {
        replies.next();
    }
    messages.extend(replies);

    let outcome = match sent {
        Ok(outcome) => outcome,
        Err(e) => return Err(Interrupted::with(e.into(), messages)),
    };

    usage.add(&outcome.usage);
    let reported = (outcome.usage != Usage::default()).then_some(outcome.usage);
    bus.emit(&AgentEvent::IterationEnd {
        iteration: 1,
        usage: reported,
    })
    .await;

    match outcome.stop_reason {
        AcpStopReason::EndTurn | AcpStopReason::Refusal => Ok(messages),
        AcpStopReason::Cancelled => Err(Interrupted::with(AgentError::Cancelled, messages)),
        AcpStopReason::MaxTokens | AcpStopReason::MaxTurnRequests => Err(Interrupted::with(
            AgentError::MaxIterationsExceeded {
                limit: agent.effective_max_iterations(),
            },
            messages,
        )),
    }
}
