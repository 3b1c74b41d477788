//! OpenAI-compatible LLM Provider
//!
//! Talks to any `/chat/completions` endpoint that follows the OpenAI wire
//! format (OpenAI itself, vLLM, LM Studio, llama.cpp server, ...). Tools use
//! native function calling; streamed responses arrive as server-sent events
//! carrying text deltas and tool call fragments.

use agent_core::{
    error::{AgentError, ProviderFailure, Result},
    message::{Message, Role, ToolCallRequest, new_call_id},
    provider::{
        CompletionStream, GenerationOptions, LlmProvider, ModelInfo, ProviderResult, StreamChunk,
        TokenUsage, ToolCallDelta,
    },
    tool::ToolSchema,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Bearer token; local servers often accept none
    pub api_key: Option<String>,

    /// Base URL up to and including the version segment
    pub base_url: String,

    /// Model used when the agent does not name one
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
        }
    }
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
        }
    }
}

/// OpenAI-compatible LLM provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(OpenAiConfig::from_env())
    }

    pub const fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn build_request_body(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Value {
        let model = if options.model.is_empty() {
            self.config.model.as_str()
        } else {
            options.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "messages": to_wire_messages(messages, options),
            "temperature": options.temperature,
            "top_p": options.top_p,
            "max_tokens": options.max_tokens,
        });
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
        }
        if options.stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

/// Convert a conversation to chat-completions messages.
///
/// Consecutive tool-call messages become one assistant message carrying
/// every call, since the wire format expects a single assistant turn per
/// batch followed by one `tool` message per call.
fn to_wire_messages(messages: &[Message], options: &GenerationOptions) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = options.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        wire.push(json!({ "role": "system", "content": system }));
    }

    let mut pending_calls: Vec<Value> = Vec::new();
    for message in messages {
        if message.role != Role::ToolCall && !pending_calls.is_empty() {
            wire.push(assistant_with_calls(std::mem::take(&mut pending_calls)));
        }
        match message.role {
            Role::User => wire.push(json!({ "role": "user", "content": message.content() })),
            Role::Assistant => {
                wire.push(json!({ "role": "assistant", "content": message.content() }));
            }
            Role::ToolCall => pending_calls.extend(message.tool_calls.iter().map(call_to_wire)),
            Role::ToolResult => wire.push(json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
                "content": message.content(),
            })),
            Role::AgentEvent => {}
        }
    }
    if !pending_calls.is_empty() {
        wire.push(assistant_with_calls(pending_calls));
    }

    wire
}

fn assistant_with_calls(calls: Vec<Value>) -> Value {
    json!({ "role": "assistant", "content": Value::Null, "tool_calls": calls })
}

fn call_to_wire(call: &ToolCallRequest) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": Value::Object(call.arguments.clone()).to_string(),
        }
    })
}

fn tool_to_wire(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.to_json_schema(),
        }
    })
}

fn malformed(msg: impl Into<String>) -> AgentError {
    AgentError::Provider(ProviderFailure::Malformed(msg.into()))
}

fn transport(err: &reqwest::Error) -> AgentError {
    AgentError::Provider(ProviderFailure::Unavailable(err.to_string()))
}

/// Non-streaming chat-completions response
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<ResponseUsage> for TokenUsage {
    fn from(usage: ResponseUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.prompt_tokens.saturating_add(usage.completion_tokens),
        }
    }
}

/// Turn a complete response body into a provider result
fn parse_completion(body: &str) -> Result<ProviderResult> {
    let response: CompletionResponse =
        serde_json::from_str(body).map_err(|e| malformed(format!("failed to parse response: {e}")))?;

    if let Some(usage) = response.usage {
        let usage = TokenUsage::from(usage);
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "openai usage"
        );
    }

    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| malformed("response contained no choices"))?
        .message;

    let tool_calls = message.tool_calls.unwrap_or_default();
    if tool_calls.is_empty() {
        return Ok(ProviderResult::FinalMessage(message.content.unwrap_or_default()));
    }
    if message.content.as_deref().is_some_and(|c| !c.trim().is_empty()) {
        tracing::debug!("dropping text that accompanied tool calls");
    }

    let calls = tool_calls
        .into_iter()
        .map(|tc| {
            let raw = tc.function.arguments.trim();
            let value = if raw.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(raw).map_err(|e| {
                    malformed(format!("invalid arguments for '{}': {e}", tc.function.name))
                })?
            };
            let call = ToolCallRequest::from_value(tc.function.name, value).map_err(malformed)?;
            Ok(call.with_id(tc.id.filter(|id| !id.is_empty()).unwrap_or_else(new_call_id)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ProviderResult::ToolInvocationRequest(calls))
}

/// One server-sent event payload of a streamed completion
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Splits a byte stream into SSE `data:` lines and decodes them.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network chunks survive intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamChunk>> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(chunk) = decode_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }
}

fn decode_line(line: &str) -> Option<Result<StreamChunk>> {
    let line = line.trim();
    // Blank separators, comments and non-data fields carry nothing for us
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamChunk::done()));
    }

    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => return Some(Err(malformed(format!("undecodable stream event: {e}")))),
    };

    let mut chunk = StreamChunk {
        usage: event.usage.map(TokenUsage::from),
        ..StreamChunk::default()
    };
    for delta in event.choices.into_iter().filter_map(|c| c.delta) {
        if let Some(content) = delta.content {
            chunk.delta.push_str(&content);
        }
        for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
            let (name, arguments) = call
                .function
                .map(|f| (f.name, f.arguments.unwrap_or_default()))
                .unwrap_or_default();
            chunk.tool_calls.push(ToolCallDelta {
                index: call.index.unwrap_or(position),
                id: call.id,
                name,
                arguments,
            });
        }
    }
    Some(Ok(chunk))
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.authorized(self.client.get(self.url("models"))).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!(error = %e, "openai health check failed");
                Ok(false)
            }
        }
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ProviderResult> {
        let body = self.build_request_body(messages, tools, options);
        tracing::debug!(
            model = %body["model"],
            messages = messages.len(),
            tools = tools.len(),
            stream = options.stream,
            "openai request"
        );

        let response = self
            .authorized(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(&e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(ProviderFailure::from_status(status, text)));
        }

        if options.stream {
            let mut decoder = SseDecoder::default();
            let stream: CompletionStream = Box::pin(
                response
                    .bytes_stream()
                    .map(move |bytes| match bytes {
                        Ok(bytes) => decoder.push(&bytes),
                        Err(e) => vec![Err(transport(&e))],
                    })
                    .flat_map(futures::stream::iter),
            );
            return Ok(ProviderResult::Stream(stream));
        }

        let text = response.text().await.map_err(|e| transport(&e))?;
        parse_completion(&text)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .authorized(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| transport(&e))?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| transport(&e))?;
        if !(200..300).contains(&status) {
            return Err(AgentError::Provider(ProviderFailure::from_status(status, text)));
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| malformed(format!("invalid model list: {e}")))?;
        Ok(json["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str())
                    .map(|id| ModelInfo {
                        id: id.to_string(),
                        name: id.to_string(),
                        context_length: None,
                        supports_vision: false,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
