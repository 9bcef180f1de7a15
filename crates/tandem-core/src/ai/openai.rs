//! OpenAI-compatible chat/completions provider
//!
//! Works against any endpoint that speaks the chat/completions format
//! (OpenAI, OpenRouter, vLLM, Ollama, ...). Streaming uses SSE with
//! `stream_options.include_usage` so token counts arrive on the final chunk.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::provider::{ChatRequest, ChatResponse, ModelProvider, StreamSink};
use super::types::{ContentPart, FinishReason, Message, Role, ToolArgs, ToolCall, Usage};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider name used when none is given
pub const PROVIDER_NAME: &str = "openai";

pub struct OpenAiProvider {
    name: String,
    client: Client,
    api_key: Option<String>,
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            name: PROVIDER_NAME.to_string(),
            client: Client::new(),
            api_key: None,
        }
    }

    /// Register under a different provider name (e.g. "openrouter")
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fallback credential for models that don't carry one
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(request: &ChatRequest) -> String {
        let base = request
            .model
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = Self::endpoint(request);
        let body = request_body(request, stream);
        debug!(provider = %self.name, model = %request.model.model, url = %url, stream, "Calling model");

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = request.model.api_key.as_ref().or(self.api_key.as_ref()) {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &request.model.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} returned {}: {}", self.name, status, error_message(&text)));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let response = self.send(&request, false).await?;
        let json: Value = response.json().await.context("invalid completion body")?;
        parse_completion(&json)
    }

    async fn chat_stream(&self, request: ChatRequest, sink: &dyn StreamSink) -> Result<ChatResponse> {
        let response = self.send(&request, true).await?;
        let mut stream = response.bytes_stream();
        let mut accumulator = StreamAccumulator::default();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("stream interrupted")?;

            for line in lines.push(&chunk) {
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(accumulator.finish());
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(event) => {
                        for delta in accumulator.apply(&event)? {
                            match delta {
                                StreamDelta::Text(text) => sink.on_text(&text).await,
                                StreamDelta::ToolStart { id, name } => {
                                    sink.on_tool_call_start(&id, &name).await
                                }
                            }
                        }
                    }
                    Err(e) => warn!(provider = %self.name, error = %e, "Skipping malformed SSE data"),
                }
            }
        }

        Ok(accumulator.finish())
    }
}

/// Build the chat/completions request body
pub(crate) fn request_body(request: &ChatRequest, stream: bool) -> Value {
    let model = &request.model;
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model.model));
    body.insert(
        "messages".to_string(),
        Value::Array(request.messages.iter().map(wire_message).collect()),
    );

    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(temperature) = model.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = model.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if stream {
        body.insert("stream".to_string(), json!(true));
        body.insert("stream_options".to_string(), json!({ "include_usage": true }));
    }

    for (key, value) in &model.extra_body {
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body)
}

fn wire_message(message: &Message) -> Value {
    let mut wire = Map::new();
    wire.insert("role".to_string(), json!(message.role.as_str()));

    let content = if !message.parts.is_empty() {
        Value::Array(message.parts.iter().map(wire_part).collect())
    } else if message.role == Role::Assistant
        && message.content.is_empty()
        && !message.tool_calls.is_empty()
    {
        Value::Null
    } else {
        json!(message.content)
    };
    wire.insert("content".to_string(), content);

    if !message.tool_calls.is_empty() {
        let calls = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": Value::Object(call.arguments.clone()).to_string(),
                    }
                })
            })
            .collect();
        wire.insert("tool_calls".to_string(), Value::Array(calls));
    }
    if let Some(id) = &message.tool_call_id {
        wire.insert("tool_call_id".to_string(), json!(id));
    }
    if message.role != Role::Tool {
        if let Some(name) = &message.name {
            wire.insert("name".to_string(), json!(name));
        }
    }
    Value::Object(wire)
}

fn wire_part(part: &ContentPart) -> Value {
    let (mut value, cache_control) = match part {
        ContentPart::Text {
            text,
            cache_control,
        } => (json!({ "type": "text", "text": text }), cache_control),
        ContentPart::ImageUrl { url, cache_control } => (
            json!({ "type": "image_url", "image_url": { "url": url } }),
            cache_control,
        ),
    };
    if let Some(cache_control) = cache_control {
        if let Ok(hint) = serde_json::to_value(cache_control) {
            value["cache_control"] = hint;
        }
    }
    value
}

/// Tool arguments arrive as a JSON string; anything unparseable becomes empty.
fn parse_arguments(raw: &str) -> ToolArgs {
    if raw.trim().is_empty() {
        return ToolArgs::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(arguments = %other, "Tool arguments are not an object");
            ToolArgs::new()
        }
        Err(e) => {
            warn!(error = %e, "Unparseable tool arguments");
            ToolArgs::new()
        }
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    let object = usage.as_object()?;
    let count = |key: &str| object.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(Usage {
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
        cached_tokens: usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_tokens: count("total_tokens"),
    })
}

/// Parse a non-streaming completion body
pub(crate) fn parse_completion(json: &Value) -> Result<ChatResponse> {
    let choice = json
        .pointer("/choices/0")
        .ok_or_else(|| anyhow!("completion has no choices"))?;
    let message = choice.get("message").unwrap_or(&Value::Null);

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: parse_arguments(
                        call.pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    ),
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_wire)
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        finish_reason,
        usage: json.get("usage").and_then(parse_usage),
        tool_calls,
    })
}

/// Pull a readable message out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

/// Splits a byte stream into lines, decoding each one only once it is complete
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
enum StreamDelta {
    Text(String),
    ToolStart { id: String, name: String },
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds SSE chunks into one `ChatResponse`
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    fn apply(&mut self, event: &Value) -> Result<Vec<StreamDelta>> {
        if let Some(error) = event.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("stream error: {}", message));
        }

        if let Some(usage) = event.get("usage").and_then(parse_usage) {
            self.usage = Some(usage);
        }

        let mut deltas = Vec::new();
        let Some(choice) = event.pointer("/choices/0") else {
            return Ok(deltas);
        };

        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                deltas.push(StreamDelta::Text(text.to_string()));
            }
        }

        if let Some(calls) = choice.pointer("/delta/tool_calls").and_then(Value::as_array) {
            for fragment in calls {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = self.calls.entry(index).or_default();
                let announced = !partial.id.is_empty() && !partial.name.is_empty();

                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    partial.id.push_str(id);
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(args) = fragment
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    partial.arguments.push_str(args);
                }

                if !announced && !partial.id.is_empty() && !partial.name.is_empty() {
                    deltas.push(StreamDelta::ToolStart {
                        id: partial.id.clone(),
                        name: partial.name.clone(),
                    });
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(FinishReason::from_wire(reason));
        }

        Ok(deltas)
    }

    fn finish(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_values()
            .map(|partial| ToolCall {
                id: partial.id,
                name: partial.name,
                arguments: parse_arguments(&partial.arguments),
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        ChatResponse {
            content: self.content,
            finish_reason,
            usage: self.usage,
            tool_calls,
        }
    }
}
