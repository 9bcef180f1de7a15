//! Scripted provider for tests and dry runs
//!
//! Replays queued responses in order and records every request it receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::provider::{ChatRequest, ChatResponse, ModelProvider};

type Responder = Arc<dyn Fn(usize) -> ChatResponse + Send + Sync>;

/// A mock provider that returns pre-configured responses
pub struct MockProvider {
    name: String,
    responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
    fallback: Option<Responder>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// Answer every call past the queue with `responder(call_index)`
    pub fn with_fallback(
        mut self,
        responder: impl Fn(usize) -> ChatResponse + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Arc::new(responder));
        self
    }

    pub fn push_response(&self, response: ChatResponse) {
        lock(&self.responses).push_back(Ok(response));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        lock(&self.responses).push_back(Err(message.into()));
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let index = {
            let mut requests = lock(&self.requests);
            requests.push(request);
            requests.len() - 1
        };

        let queued = lock(&self.responses).pop_front();
        match queued {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => match &self.fallback {
                Some(responder) => Ok(responder(index)),
                None => Ok(ChatResponse::text("")),
            },
        }
    }
}
