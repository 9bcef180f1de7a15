//! Outcome of one agent invocation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::types::{Message, Usage};
use crate::error::AgentError;

/// Why an invocation ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxIterations,
    Error,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxIterations => "max_iterations",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        }
    }

    pub(crate) fn for_error(error: &AgentError) -> Self {
        match error {
            AgentError::Cancelled => StopReason::Cancelled,
            AgentError::MaxIterationsExceeded { .. } => StopReason::MaxIterations,
            _ => StopReason::Error,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary reported on `agent.end`, success or not
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub stop_reason: StopReason,
    pub duration: Duration,
    /// Summed over every model call in the invocation
    pub usage: Usage,
    pub error: Option<String>,
}

/// A completed invocation
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Input conversation plus everything appended by the loop
    pub conversation: Vec<Message>,
    pub result: TurnResult,
}

/// A failed invocation
///
/// `conversation` holds the partial conversation when the failure happened
/// after the loop started appending (cancellation, iteration cap, external
/// agent errors) and is `None` for configuration and model-call failures.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct AgentFailure {
    #[source]
    pub error: AgentError,
    pub conversation: Option<Vec<Message>>,
    pub result: TurnResult,
}
