//! Agentic loop controller
//!
//! `AgentLoop::execute` alternates model calls and tool dispatch until the
//! model answers without tool calls, the iteration cap is reached, the
//! caller cancels, or the model call fails.
//!
//! ```text
//!  Init ─► IterationStart ─► ModelCall ─┬─ no tool calls ─► EndTurn
//!              ▲                        └─ tool calls ─► ToolDispatch ─► IterationEnd ─┐
//!              └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation is checked at iteration boundaries only; an in-flight model
//! or tool call runs to completion. Agents with an external config hand the
//! whole turn to an external agent process instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::{AgentCallbacks, EventBus};
use super::config::AgentConfig;
use super::events::AgentEvent;
use super::external;
use super::result::{AgentFailure, AgentRun, StopReason, TurnResult};
use crate::acp::ClientRegistry;
use crate::ai::provider::{ChatRequest, ChatResponse, ModelProvider, ProviderRegistry, StreamSink};
use crate::ai::types::{Message, Role, ToolCall, ToolCallStatus, ToolCallUpdate, Usage};
use crate::error::AgentError;
use crate::tools::{ToolDispatcher, DEFAULT_TOOL_TIMEOUT};

/// A loop-level failure plus whatever conversation is safe to hand back
pub(super) struct Interrupted {
    pub(super) error: AgentError,
    pub(super) conversation: Option<Vec<Message>>,
}

impl Interrupted {
    /// Failure before any conversation progress (config, provider)
    pub(super) fn bare(error: AgentError) -> Self {
        Self {
            error,
            conversation: None,
        }
    }

    pub(super) fn with(error: AgentError, conversation: Vec<Message>) -> Self {
        Self {
            error,
            conversation: Some(conversation),
        }
    }
}

/// Runs agents against registered model providers
pub struct AgentLoop {
    providers: Arc<ProviderRegistry>,
    external: Option<Arc<ClientRegistry>>,
    tool_timeout: Duration,
}

impl AgentLoop {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            external: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Enable delegation for agents that name an external agent
    pub fn with_external_registry(mut self, registry: Arc<ClientRegistry>) -> Self {
        self.external = Some(registry);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Run one agent invocation over `conversation`.
    ///
    /// Emits `agent.start` first and exactly one `agent.end` on every exit path.
    pub async fn execute(
        &self,
        conversation: Vec<Message>,
        agent: &AgentConfig,
        callbacks: Option<Arc<dyn AgentCallbacks>>,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, AgentFailure> {
        let started = Instant::now();
        let bus = EventBus::new(callbacks);
        let mut usage = Usage::default();

        bus.emit(&AgentEvent::Start {
            message: last_user_text(&conversation).unwrap_or_default().to_string(),
        })
        .await;

        let conversation = persisted(conversation);
        let outcome = match &agent.external {
            Some(external_config) => match &self.external {
                Some(registry) => {
                    external::run_external(
                        registry,
                        conversation,
                        agent,
                        external_config,
                        &bus,
                        cancel,
                        &mut usage,
                    )
                    .await
                }
                None => Err(Interrupted::bare(AgentError::config(
                    &agent.name,
                    "external agent configured but no client registry available",
                ))),
            },
            None => self.run_loop(conversation, agent, &bus, cancel, &mut usage).await,
        };

        let (stop_reason, error) = match &outcome {
            Ok(_) => (StopReason::EndTurn, None),
            Err(interrupted) => (
                StopReason::for_error(&interrupted.error),
                Some(interrupted.error.to_string()),
            ),
        };
        let result = TurnResult {
            stop_reason,
            duration: started.elapsed(),
            usage,
            error,
        };

        info!(
            agent = %agent.name,
            stop_reason = %result.stop_reason,
            duration_ms = result.duration.as_millis() as u64,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "Agent invocation finished"
        );
        bus.emit(&AgentEvent::End {
            result: result.clone(),
        })
        .await;

        match outcome {
            Ok(conversation) => Ok(AgentRun {
                conversation,
                result,
            }),
            Err(interrupted) => Err(AgentFailure {
                error: interrupted.error,
                conversation: interrupted.conversation,
                result,
            }),
        }
    }

    async fn run_loop(
        &self,
        conversation: Vec<Message>,
        agent: &AgentConfig,
        bus: &EventBus,
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<Vec<Message>, Interrupted> {
        let model = agent.require_model().map_err(Interrupted::bare)?;
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            Interrupted::bare(AgentError::UnknownProvider {
                agent: agent.name.clone(),
                provider: model.provider.clone(),
            })
        })?;

        let dispatcher = ToolDispatcher::new(&agent.tools).with_timeout(self.tool_timeout);
        let tools = dispatcher.advertisements().await;
        let max_iterations = agent.effective_max_iterations();
        let mut messages = conversation;

        debug!(
            agent = %agent.name,
            provider = %model.provider,
            model = %model.model,
            tools = tools.len(),
            max_iterations,
            "Starting agent loop"
        );

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                info!(agent = %agent.name, iteration, "Agent cancelled");
                return Err(Interrupted::with(AgentError::Cancelled, messages));
            }

            bus.emit(&AgentEvent::IterationStart { iteration }).await;

            let request = ChatRequest {
                model: Arc::clone(model),
                messages: outgoing(agent.system_prompt(), &messages),
                tools: tools.clone(),
            };

            let response = match call_model(provider.as_ref(), request, model.stream, bus).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(agent = %agent.name, iteration, error = %format!("{:#}", e), "Model call failed");
                    return Err(Interrupted::bare(AgentError::Provider(e)));
                }
            };

            if let Some(reported) = &response.usage {
                usage.add(reported);
            }

            if response.tool_calls.is_empty() {
                messages.push(Message::assistant(response.content));
                bus.emit(&AgentEvent::IterationEnd {
                    iteration,
                    usage: response.usage,
                })
                .await;
                return Ok(messages);
            }

            debug!(
                agent = %agent.name,
                iteration,
                tool_calls = response.tool_calls.len(),
                "Model requested tools"
            );
            messages.push(Message::assistant_with_tools(
                response.content,
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let content = run_tool(call, &dispatcher, bus).await;
                messages.push(Message::tool(&call.id, &call.name, content));
            }

            bus.emit(&AgentEvent::IterationEnd {
                iteration,
                usage: response.usage,
            })
            .await;
        }

        warn!(agent = %agent.name, max_iterations, "Agent hit iteration cap");
        Err(Interrupted::with(
            AgentError::MaxIterationsExceeded {
                limit: max_iterations,
            },
            messages,
        ))
    }
}

async fn call_model(
    provider: &dyn ModelProvider,
    request: ChatRequest,
    stream: bool,
    bus: &EventBus,
) -> anyhow::Result<ChatResponse> {
    if stream {
        provider.chat_stream(request, &BusSink { bus }).await
    } else {
        provider.chat(request).await
    }
}

/// Streams model output onto the event bus and the caller's callbacks
struct BusSink<'a> {
    bus: &'a EventBus,
}

#[async_trait]
impl StreamSink for BusSink<'_> {
    async fn on_text(&self, delta: &str) {
        self.bus
            .emit(&AgentEvent::Chunk {
                content: delta.to_string(),
            })
            .await;
        self.bus.callbacks().on_chunk(delta).await;
    }

    async fn on_tool_call_start(&self, id: &str, name: &str) {
        self.bus.callbacks().on_tool_call_start(id, name).await;
    }
}

/// Run one tool call: tool-start override, then custom executor, then dispatcher.
/// Returns the content of the tool-result message.
async fn run_tool(call: &ToolCall, dispatcher: &ToolDispatcher<'_>, bus: &EventBus) -> String {
    let started = Instant::now();

    let outcome = match bus
        .intercept(&AgentEvent::ToolStart { call: call.clone() })
        .await
    {
        Some(over) => over.into_outcome(),
        None => match bus.callbacks().execute_tool(call).await {
            Some(outcome) => outcome,
            None => dispatcher.execute(call).await.map_err(|e| e.to_string()),
        },
    };
    let duration = started.elapsed();

    let (status, output, error) = match &outcome {
        Ok(output) => (ToolCallStatus::Completed, Some(output.clone()), None),
        Err(error) => (ToolCallStatus::Failed, None, Some(error.clone())),
    };
    let update = ToolCallUpdate {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
        status,
        duration: Some(duration),
        output,
        error,
    };

    let outcome = match bus.intercept(&AgentEvent::ToolEnd { update }).await {
        Some(over) => over.into_outcome(),
        None => outcome,
    };

    match outcome {
        Ok(output) => output,
        Err(error) => {
            debug!(tool = %call.name, id = %call.id, error = %error, "Tool call failed");
            format!("Error executing tool: {}", error)
        }
    }
}

/// Request messages: system prompt first, then the running conversation
fn outgoing(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Message> {
    let mut request = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt {
        request.push(Message::system(prompt));
    }
    request.extend_from_slice(messages);
    request
}

/// Drop system messages; the system prompt only ever lives in the request.
fn persisted(conversation: Vec<Message>) -> Vec<Message> {
    let before = conversation.len();
    let kept: Vec<Message> = conversation
        .into_iter()
        .filter(|m| m.role != Role::System)
        .collect();
    if kept.len() != before {
        warn!(
            dropped = before - kept.len(),
            "Dropped system messages from conversation; use the agent's system prompt"
        );
    }
    kept
}

pub(super) fn last_user_text(conversation: &[Message]) -> Option<&str> {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::ModelConfig;
    use crate::agent::events::EVENT_END;
    use crate::ai::mock::MockProvider;
    use crate::tools::{AgentTool, NativeTool, ScriptParam, ScriptTool};
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn model() -> Arc<ModelConfig> {
        Arc::new(ModelConfig::new("mock", "test-model"))
    }

    fn agent_loop(provider: Arc<MockProvider>) -> AgentLoop {
        AgentLoop::new(Arc::new(ProviderRegistry::new().with(provider)))
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn weather_tool(counter: Arc<AtomicUsize>) -> AgentTool {
        ScriptTool::from_fn(
            "weather",
            "Current weather for a city",
            vec![ScriptParam::new("city")],
            move |_args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("sunny,72"))
                }
            },
        )
        .into()
    }

    /// Records events and replies to tool events with a fixed value
    #[derive(Default)]
    struct Listener {
        events: Mutex<Vec<(String, Value)>>,
        on_tool_start: Option<Value>,
        on_tool_end: Option<Value>,
        executor: Option<Result<String, String>>,
        chunks: Mutex<Vec<String>>,
    }

    impl Listener {
        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(n, _)| n.clone())
                .collect()
        }

        fn payloads(&self, name: &str) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AgentCallbacks for Listener {
        async fn emit(&self, event: &str, payload: &Value) -> Option<Value> {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload.clone()));
            match event {
                "agent.tool.start" => self.on_tool_start.clone(),
                "agent.tool.end" => self.on_tool_end.clone(),
                // observational: return values must be ignored
                _ => Some(json!({"result": "ignored"})),
            }
        }

        async fn on_chunk(&self, content: &str) {
            self.chunks.lock().unwrap().push(content.to_string());
        }

        async fn execute_tool(&self, _call: &ToolCall) -> Option<Result<String, String>> {
            self.executor.clone()
        }
    }

    #[tokio::test]
    async fn test_single_turn_answer() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::text("The answer is 4"));
        let agent = AgentConfig::new("math", model());

        let run = agent_loop(provider.clone())
            .execute(
                vec![Message::user("What is 2+2?")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.conversation.len(), 2);
        assert_eq!(run.conversation[0].role, Role::User);
        assert_eq!(run.conversation[0].content, "What is 2+2?");
        assert_eq!(run.conversation[1].role, Role::Assistant);
        assert_eq!(run.conversation[1].content, "The answer is 4");
        assert_eq!(run.result.stop_reason, StopReason::EndTurn);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_weather_tool_round_trip() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("call_1", "weather", json!({"city": "Austin"}))],
        ));
        provider.push_response(ChatResponse::text("It's sunny and 72 in Austin."));

        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("forecaster", model()).with_tool(weather_tool(runs.clone()));

        let run = agent_loop(provider.clone())
            .execute(
                vec![Message::user("Weather in Austin?")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let roles: Vec<Role> = run.conversation.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(run.conversation[1].tool_calls[0].id, "call_1");
        assert_eq!(run.conversation[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(run.conversation[2].content.contains("sunny,72"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // the second request carries the tool exchange
        let requests = provider.requests();
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[0].tools[0].name, "weather");
    }

    #[tokio::test]
    async fn test_system_prompt_only_in_request() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Oslo"}))],
        ));
        provider.push_response(ChatResponse::text("cold"));
        let agent = AgentConfig::new("forecaster", model())
            .with_system_prompt("You are terse.")
            .with_tool(weather_tool(Arc::new(AtomicUsize::new(0))));

        let run = agent_loop(provider.clone())
            .execute(
                vec![Message::user("Oslo?")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(run.conversation.iter().all(|m| m.role != Role::System));
        for request in provider.requests() {
            assert_eq!(request.messages[0].role, Role::System);
            assert_eq!(request.messages[0].content, "You are terse.");
            assert_eq!(
                request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .count(),
                1
            );
        }
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let provider = Arc::new(MockProvider::new("mock").with_fallback(|i| {
            ChatResponse::with_tool_calls(
                "",
                vec![ToolCall {
                    id: format!("call_{}", i),
                    name: "weather".to_string(),
                    arguments: Default::default(),
                }],
            )
        }));
        let agent = AgentConfig::new("looper", model())
            .with_max_iterations(3)
            .with_tool(weather_tool(Arc::new(AtomicUsize::new(0))));
        let listener = Arc::new(Listener::default());

        let failure = agent_loop(provider.clone())
            .execute(
                vec![Message::user("loop forever")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            AgentError::MaxIterationsExceeded { limit: 3 }
        ));
        assert_eq!(failure.result.stop_reason, StopReason::MaxIterations);
        assert_eq!(provider.call_count(), 3);

        let conversation = failure.conversation.unwrap();
        let assistants = conversation
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        let tools = conversation.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!(assistants, 3);
        assert_eq!(tools, 3);
        assert_eq!(listener.payloads(EVENT_END).len(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_max_iterations_uses_default() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::text("done"));
        let agent = AgentConfig::new("a", model()).with_max_iterations(0);

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("hi")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.result.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_tool_error_recovered() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "explode", json!({}))],
        ));
        provider.push_response(ChatResponse::text("that failed"));
        let agent = AgentConfig::new("a", model()).with_tool(
            NativeTool::from_fn("explode", "Always fails", json!({"type": "object"}), |_| async {
                Err(anyhow!("kaboom"))
            })
            .into(),
        );

        let run = agent_loop(provider.clone())
            .execute(
                vec![Message::user("go")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 2);
        assert!(run.conversation[2]
            .content
            .starts_with("Error executing tool:"));
        assert!(run.conversation[2].content.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_tool_recovered() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "nope", json!({}))],
        ));
        provider.push_response(ChatResponse::text("ok"));
        let agent = AgentConfig::new("a", model());

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("go")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            run.conversation[2].content,
            "Error executing tool: tool 'nope' not found"
        );
    }

    #[tokio::test]
    async fn test_missing_script_argument_recovered() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({}))],
        ));
        provider.push_response(ChatResponse::text("need a city"));
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("a", model()).with_tool(weather_tool(runs.clone()));

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("weather?")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            run.conversation[2].content,
            "Error executing tool: missing required argument 'city' for tool 'weather'"
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tool_start_override_skips_execution() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Rome"}))],
        ));
        provider.push_response(ChatResponse::text("done"));
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("a", model()).with_tool(weather_tool(runs.clone()));
        let listener = Arc::new(Listener {
            on_tool_start: Some(json!({"result": "X"})),
            ..Default::default()
        });

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Rome?")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(run.conversation[2].content, "X");
    }

    #[tokio::test]
    async fn test_tool_end_override_replaces_result() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Rome"}))],
        ));
        provider.push_response(ChatResponse::text("done"));
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("a", model()).with_tool(weather_tool(runs.clone()));
        let listener = Arc::new(Listener {
            on_tool_end: Some(json!({"result": "Y"})),
            ..Default::default()
        });

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Rome?")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(run.conversation[2].content, "Y");

        let end = &listener.payloads("agent.tool.end")[0];
        assert_eq!(end["toolCall"]["output"], "sunny,72");
        assert!(end["toolCall"]["durationMs"].is_u64());
    }

    #[tokio::test]
    async fn test_override_error_wraps_content() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Rome"}))],
        ));
        provider.push_response(ChatResponse::text("done"));
        let agent = AgentConfig::new("a", model())
            .with_tool(weather_tool(Arc::new(AtomicUsize::new(0))));
        let listener = Arc::new(Listener {
            on_tool_start: Some(json!({"result": "", "error": "blocked by policy"})),
            ..Default::default()
        });

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Rome?")],
                &agent,
                Some(listener),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            run.conversation[2].content,
            "Error executing tool: blocked by policy"
        );
    }

    #[tokio::test]
    async fn test_non_string_result_is_not_an_override() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Rome"}))],
        ));
        provider.push_response(ChatResponse::text("done"));
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("a", model()).with_tool(weather_tool(runs.clone()));
        let listener = Arc::new(Listener {
            on_tool_start: Some(json!({"result": 42})),
            ..Default::default()
        });

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Rome?")],
                &agent,
                Some(listener),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(run.conversation[2].content, "sunny,72");
    }

    #[tokio::test]
    async fn test_custom_executor_before_dispatcher() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "weather", json!({"city": "Rome"}))],
        ));
        provider.push_response(ChatResponse::text("done"));
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = AgentConfig::new("a", model()).with_tool(weather_tool(runs.clone()));
        let listener = Arc::new(Listener {
            executor: Some(Ok("from host".to_string())),
            ..Default::default()
        });

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Rome?")],
                &agent,
                Some(listener),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(run.conversation[2].content, "from host");
    }

    #[tokio::test]
    async fn test_tools_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tool = |name: &'static str| -> AgentTool {
            let order = Arc::clone(&order);
            NativeTool::from_fn(name, "records", json!({"type": "object"}), move |_| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    Ok(json!(name))
                }
            })
            .into()
        };

        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![
                call("c1", "first", json!({})),
                call("c2", "second", json!({})),
                call("c3", "third", json!({})),
            ],
        ));
        provider.push_response(ChatResponse::text("done"));
        let agent = AgentConfig::new("a", model())
            .with_tool(tool("third"))
            .with_tool(tool("first"))
            .with_tool(tool("second"));

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("go")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        let ids: Vec<_> = run.conversation[2..5]
            .iter()
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_provider_error_returns_no_conversation() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_error("rate limited");
        let agent = AgentConfig::new("a", model());
        let listener = Arc::new(Listener::default());

        let failure = agent_loop(provider.clone())
            .execute(
                vec![Message::user("hi")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AgentError::Provider(_)));
        assert!(failure.conversation.is_none());
        assert_eq!(failure.result.stop_reason, StopReason::Error);
        assert_eq!(provider.call_count(), 1);

        let end = listener.payloads(EVENT_END);
        assert_eq!(end.len(), 1);
        assert_eq!(end[0]["result"]["stopReason"], "error");
        assert!(end[0]["result"]["error"]
            .as_str()
            .unwrap()
            .contains("rate limited"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_iteration() {
        let provider = Arc::new(MockProvider::new("mock"));
        let agent = AgentConfig::new("a", model());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = agent_loop(provider.clone())
            .execute(vec![Message::user("hi")], &agent, None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AgentError::Cancelled));
        assert_eq!(failure.result.stop_reason, StopReason::Cancelled);
        assert_eq!(failure.conversation.unwrap().len(), 1);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_tool_stops_at_next_boundary() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::with_tool_calls(
            "",
            vec![call("c1", "stop", json!({}))],
        ));
        let agent = AgentConfig::new("a", model()).with_tool(
            NativeTool::from_fn("stop", "Cancels", json!({"type": "object"}), move |_| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Ok(json!("stopping"))
                }
            })
            .into(),
        );

        let failure = agent_loop(provider.clone())
            .execute(vec![Message::user("hi")], &agent, None, &cancel)
            .await
            .unwrap_err();

        // the in-flight tool finished and was recorded
        let conversation = failure.conversation.unwrap();
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[2].content, "stopping");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(failure.result.stop_reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_model_is_config_error() {
        let provider = Arc::new(MockProvider::new("mock"));
        let agent = AgentConfig {
            name: "nomodel".to_string(),
            ..Default::default()
        };
        let listener = Arc::new(Listener::default());

        let failure = agent_loop(provider.clone())
            .execute(
                vec![Message::user("hi")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(failure.error, AgentError::Config { .. }));
        assert!(failure.conversation.is_none());
        assert_eq!(provider.call_count(), 0);
        assert_eq!(listener.names(), vec!["agent.start", "agent.end"]);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let provider = Arc::new(MockProvider::new("mock"));
        let agent = AgentConfig::new("a", Arc::new(ModelConfig::new("nowhere", "m")));

        let failure = agent_loop(provider)
            .execute(
                vec![Message::user("hi")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            AgentError::UnknownProvider { ref provider, .. } if provider == "nowhere"
        ));
    }

    #[tokio::test]
    async fn test_event_sequence_and_usage() {
        let provider = Arc::new(MockProvider::new("mock"));
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            cached_tokens: 2,
            total_tokens: 15,
        };
        provider.push_response(
            ChatResponse::with_tool_calls("", vec![call("c1", "weather", json!({"city": "Lima"}))])
                .with_usage(usage),
        );
        provider.push_response(ChatResponse::text("warm"));
        let agent = AgentConfig::new("a", model())
            .with_tool(weather_tool(Arc::new(AtomicUsize::new(0))));
        let listener = Arc::new(Listener::default());

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("Lima?")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            listener.names(),
            vec![
                "agent.start",
                "agent.iteration.start",
                "agent.tool.start",
                "agent.tool.end",
                "agent.iteration.end",
                "agent.iteration.start",
                "agent.iteration.end",
                "agent.end",
            ]
        );
        assert_eq!(listener.payloads("agent.start")[0]["message"], "Lima?");
        let iteration_ends = listener.payloads("agent.iteration.end");
        assert_eq!(iteration_ends[0]["usage"]["inputTokens"], 10);
        assert_eq!(iteration_ends[0]["usage"]["cachedTokens"], 2);
        assert!(iteration_ends[1].get("usage").is_none());
        assert_eq!(iteration_ends[1]["iteration"], 2);

        assert_eq!(run.result.usage.prompt_tokens, 10);
        let end = &listener.payloads(EVENT_END)[0];
        assert_eq!(end["result"]["totalInputTokens"], 10);
        assert_eq!(end["result"]["totalOutputTokens"], 5);
        assert!(end["result"]["error"].is_null());
    }

    #[tokio::test]
    async fn test_streaming_forwards_chunks() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::text("streamed answer"));
        let streaming = Arc::new(ModelConfig {
            stream: true,
            ..ModelConfig::new("mock", "m")
        });
        let agent = AgentConfig::new("a", streaming);
        let listener = Arc::new(Listener::default());

        let run = agent_loop(provider)
            .execute(
                vec![Message::user("hi")],
                &agent,
                Some(listener.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.conversation[1].content, "streamed answer");
        assert_eq!(
            *listener.chunks.lock().unwrap(),
            vec!["streamed answer".to_string()]
        );
        assert_eq!(
            listener.payloads("agent.chunk")[0]["content"],
            "streamed answer"
        );
    }

    #[tokio::test]
    async fn test_input_system_messages_not_persisted() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_response(ChatResponse::text("ok"));
        let agent = AgentConfig::new("a", model());

        let run = agent_loop(provider)
            .execute(
                vec![Message::system("stale"), Message::user("hi")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(run.conversation.iter().all(|m| m.role != Role::System));
        assert_eq!(run.conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_external_without_registry_is_config_error() {
        let provider = Arc::new(MockProvider::new("mock"));
        let agent = AgentConfig::new("ext", model())
            .with_external(crate::agent::config::ExternalAgentConfig::new("agent-bin"));

        let failure = agent_loop(provider)
            .execute(
                vec![Message::user("hi")],
                &agent,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(failure.error, AgentError::Config { .. }));
    }
}
