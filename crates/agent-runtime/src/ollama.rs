//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference.
//!
//! Tools are offered through the system prompt and come back as
//! ```` ```tool ```` blocks in the assistant text, so any local model can
//! use them. Streaming is used only for plain chat, where there is no block
//! to parse.

use std::collections::HashMap;

use agent_core::{
    error::{AgentError, ProviderFailure, Result},
    message::{Message, Role, ToolCallRequest},
    provider::{GenerationOptions, LlmProvider, ModelInfo, ProviderResult, StreamChunk, TokenUsage},
    tool::{render_tool_prompt, ToolSchema},
};
use async_trait::async_trait;
use futures::StreamExt;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage},
    models::ModelOptions,
    Ollama,
};
use serde::Deserialize;

const TOOL_FENCE: &str = "```tool";
const FENCE_END: &str = "```";

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost".into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self { host, port }
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: Ollama::new(config.host.clone(), config.port),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Convert a conversation to Ollama chat messages.
    ///
    /// Tool calls are replayed as the fenced blocks the model emitted, tool
    /// results as user context; agent events are bookkeeping and skipped.
    fn convert_messages(
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Vec<ChatMessage> {
        let mut converted = Vec::with_capacity(messages.len() + 1);

        let mut system = options.system_prompt.clone().unwrap_or_default();
        if !tools.is_empty() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&render_tool_prompt(tools));
        }
        if !system.is_empty() {
            converted.push(ChatMessage::system(system));
        }

        let mut call_names: HashMap<&str, &str> = HashMap::new();
        for message in messages {
            match message.role {
                Role::User => converted.push(ChatMessage::user(message.content().to_string())),
                Role::Assistant => {
                    converted.push(ChatMessage::assistant(message.content().to_string()));
                }
                Role::ToolCall => {
                    let blocks: Vec<String> = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            call_names.insert(&call.id, &call.name);
                            let body = serde_json::json!({
                                "tool": call.name,
                                "arguments": call.arguments,
                            });
                            format!("{TOOL_FENCE}\n{body}\n{FENCE_END}")
                        })
                        .collect();
                    converted.push(ChatMessage::assistant(blocks.join("\n")));
                }
                Role::ToolResult => {
                    let name = message
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id).copied())
                        .unwrap_or("tool");
                    let verb = if message.is_error { "failed" } else { "returned" };
                    converted.push(ChatMessage::user(format!(
                        "[Tool '{name}' {verb}]\n{}",
                        message.content()
                    )));
                }
                Role::AgentEvent => {}
            }
        }

        converted
    }

    /// Build Ollama model options
    fn build_options(opts: &GenerationOptions) -> ModelOptions {
        let mut options = ModelOptions::default()
            .temperature(opts.temperature)
            .top_p(opts.top_p)
            .num_predict(i32::try_from(opts.max_tokens).unwrap_or(i32::MAX));
        if !opts.stop_sequences.is_empty() {
            options = options.stop(opts.stop_sequences.clone());
        }
        options
    }

    fn usage<T: TryInto<u32>>(prompt_eval_count: T, eval_count: T) -> TokenUsage {
        let prompt_tokens = prompt_eval_count.try_into().unwrap_or(u32::MAX);
        let completion_tokens = eval_count.try_into().unwrap_or(u32::MAX);
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    fn request(
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> ChatMessageRequest {
        ChatMessageRequest::new(
            options.model.clone(),
            Self::convert_messages(messages, tools, options),
        )
        .options(Self::build_options(options))
    }
}

fn map_error(err: impl std::fmt::Display) -> AgentError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    let failure = if lower.contains("not found") || lower.contains("404") {
        ProviderFailure::Malformed(format!("model not available: {msg}"))
    } else {
        ProviderFailure::Unavailable(msg)
    };
    AgentError::Provider(failure)
}

#[derive(Deserialize)]
struct FencedCall {
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

impl FencedCall {
    fn into_request(self) -> std::result::Result<ToolCallRequest, String> {
        ToolCallRequest::from_value(self.tool, self.arguments)
    }
}

/// Extract tool calls from assistant text.
///
/// Returns `Ok(None)` for plain text. A fenced block that does not hold a
/// valid call makes the whole response malformed.
pub fn parse_tool_calls(content: &str) -> Result<Option<Vec<ToolCallRequest>>> {
    let malformed = |msg: String| AgentError::Provider(ProviderFailure::Malformed(msg));

    let mut calls = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(TOOL_FENCE) {
        let after = &rest[start + TOOL_FENCE.len()..];
        let Some(end) = after.find(FENCE_END) else {
            return Err(malformed("unterminated tool block".into()));
        };
        let parsed: FencedCall = serde_json::from_str(after[..end].trim())
            .map_err(|e| malformed(format!("invalid tool block: {e}")))?;
        calls.push(parsed.into_request().map_err(malformed)?);
        rest = &after[end + FENCE_END.len()..];
    }

    if !calls.is_empty() {
        return Ok(Some(calls));
    }

    // Some models answer with the bare JSON object instead of a fenced block
    let trimmed = content.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') && trimmed.contains(r#""tool""#) {
        if let Ok(parsed) = serde_json::from_str::<FencedCall>(trimmed) {
            return Ok(Some(vec![parsed.into_request().map_err(malformed)?]));
        }
    }

    Ok(None)
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Ollama health check failed");
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
        let request = Self::request(messages, tools, options);

        if options.stream && tools.is_empty() {
            let stream = self
                .client
                .send_chat_messages_stream(request)
                .await
                .map_err(map_error)?;

            let mapped = stream.map(|result| {
                result
                    .map(|chunk| StreamChunk {
                        delta: chunk.message.content,
                        tool_calls: Vec::new(),
                        done: chunk.done,
                        usage: chunk
                            .final_data
                            .as_ref()
                            .map(|d| Self::usage(d.prompt_eval_count, d.eval_count)),
                    })
                    .map_err(|_| {
                        AgentError::Provider(ProviderFailure::Unavailable(
                            "ollama stream interrupted".into(),
                        ))
                    })
            });
            return Ok(ProviderResult::Stream(Box::pin(mapped)));
        }

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(map_error)?;

        if let Some(data) = &response.final_data {
            let usage = Self::usage(data.prompt_eval_count, data.eval_count);
            tracing::debug!(
                model = %options.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "ollama completion"
            );
        }

        let content = response.message.content;
        if tools.is_empty() {
            return Ok(ProviderResult::FinalMessage(content));
        }
        match parse_tool_calls(&content)? {
            Some(calls) => Ok(ProviderResult::ToolInvocationRequest(calls)),
            None => Ok(ProviderResult::FinalMessage(content)),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self.client.list_local_models().await.map_err(map_error)?;

        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None, // Not exposed by Ollama API
                supports_vision: false,
            })
            .collect())
    }
}
