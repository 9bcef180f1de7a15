//! Caller hooks and the event bus that drives them
//!
//! `AgentCallbacks` is the caller-facing listener. Every method has a no-op
//! default, so passing no callbacks and passing `NoopCallbacks` behave the same.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use super::events::{AgentEvent, ToolOverride};
use crate::ai::types::ToolCall;

/// Hooks into an agent invocation
#[async_trait]
pub trait AgentCallbacks: Send + Sync {
    /// Receives every lifecycle event as `(name, payload)`.
    ///
    /// The return value is only inspected for `agent.tool.start` and
    /// `agent.tool.end`, where `{"result": "..."}` overrides the tool outcome.
    async fn emit(&self, _event: &str, _payload: &Value) -> Option<Value> {
        None
    }

    /// Streamed text from the model or an external agent
    async fn on_chunk(&self, _content: &str) {}

    /// A streaming model began a tool call; arguments may still be arriving.
    async fn on_tool_call_start(&self, _id: &str, _name: &str) {}

    /// Custom executor consulted before the tool dispatcher.
    /// `None` defers to the dispatcher; `Err` is treated as a tool failure.
    async fn execute_tool(&self, _call: &ToolCall) -> Option<Result<String, String>> {
        None
    }
}

/// Callbacks that observe nothing and override nothing
pub struct NoopCallbacks;

impl AgentCallbacks for NoopCallbacks {}

/// Fans events out to the caller's callbacks
#[derive(Clone)]
pub struct EventBus {
    callbacks: Arc<dyn AgentCallbacks>,
}

impl EventBus {
    pub fn new(callbacks: Option<Arc<dyn AgentCallbacks>>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_else(|| Arc::new(NoopCallbacks)),
        }
    }

    pub fn callbacks(&self) -> &dyn AgentCallbacks {
        self.callbacks.as_ref()
    }

    /// Fire an observational event. The listener's return value is dropped.
    pub async fn emit(&self, event: &AgentEvent) {
        let _ = self.dispatch(event).await;
    }

    /// Fire an interceptable event and parse any override the listener returned
    pub async fn intercept(&self, event: &AgentEvent) -> Option<ToolOverride> {
        debug_assert!(event.is_interceptable());
        let returned = self.dispatch(event).await?;
        let parsed = ToolOverride::from_value(&returned);
        if parsed.is_some() {
            tracing::debug!(event = event.name(), "Listener overrode tool outcome");
        }
        parsed
    }

    /// A panicking listener is logged and treated as returning nothing.
    async fn dispatch(&self, event: &AgentEvent) -> Option<Value> {
        let name = event.name();
        let payload = event.payload();
        match AssertUnwindSafe(self.callbacks.emit(name, &payload))
            .catch_unwind()
            .await
        {
            Ok(returned) => returned,
            Err(_) => {
                tracing::error!(event = name, "Event listener panicked");
                None
            }
        }
    }
}
