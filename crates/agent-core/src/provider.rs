//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM providers (Ollama, OpenAI-compatible
//! endpoints, etc.) allowing the orchestration loop to work with any backend
//! without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{LlmProvider, GenerationOptions, ProviderResult};
//!
//! let result = provider.send(&messages, &tool_schemas, &options).await?;
//! match result {
//!     ProviderResult::FinalMessage(text) => println!("{text}"),
//!     ProviderResult::ToolInvocationRequest(calls) => dispatch(calls),
//!     ProviderResult::Stream(stream) => consume(stream),
//! }
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ProviderFailure, Result};
use crate::message::{Message, ToolCallRequest};
use crate::tool::ToolSchema;

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "llama3.2", "gpt-4o-mini")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// System prompt (the active agent's instructions)
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Ask for the incremental variant of the response
    #[serde(default)]
    pub stream: bool,
}

const fn default_temperature() -> f32 { 0.7 }
const fn default_max_tokens() -> u32 { 2048 }
const fn default_top_p() -> f32 { 0.9 }

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            stop_sequences: Vec::new(),
            system_prompt: None,
            stream: false,
        }
    }
}

/// Token usage statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A fragment of a tool call, keyed by its position in the response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the provider turn
    pub index: usize,

    /// Call ID, usually only on the first fragment
    #[serde(default)]
    pub id: Option<String>,

    /// Tool name, usually only on the first fragment
    #[serde(default)]
    pub name: Option<String>,

    /// Raw argument JSON text to append
    #[serde(default)]
    pub arguments: String,
}

/// A chunk from streaming completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// The text delta
    #[serde(default)]
    pub delta: String,

    /// Tool call fragments
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Whether this is the final chunk
    pub done: bool,

    /// Token usage (typically only on final chunk)
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// Stream type for completion streaming
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// What a provider produced for one query
pub enum ProviderResult {
    /// Terminal assistant text
    FinalMessage(String),

    /// One or more tool invocations, in request order
    ToolInvocationRequest(Vec<ToolCallRequest>),

    /// Incremental fragments, consumed until a `done` chunk
    Stream(CompletionStream),
}

impl std::fmt::Debug for ProviderResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FinalMessage(text) => f.debug_tuple("FinalMessage").field(text).finish(),
            Self::ToolInvocationRequest(calls) => {
                f.debug_tuple("ToolInvocationRequest").field(calls).finish()
            }
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Information about a model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: Option<u32>,
    pub supports_vision: bool,
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The orchestration loop works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "ollama", "openai")
    fn name(&self) -> &str;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Query the backend with a conversation snapshot and the active
    /// agent's tool schemas. `tools` may be empty for plain chat.
    ///
    /// Backend errors must surface as [`AgentError::Provider`].
    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ProviderResult>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }
}

/// Provider selection strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderStrategy {
    /// Use a single provider
    Single,

    /// Failover to next provider on a retryable error
    Failover,

    /// Round-robin load balancing
    RoundRobin,
}

/// Multi-provider wrapper with failover support
pub struct ProviderChain {
    name: String,
    providers: Vec<Arc<dyn LlmProvider>>,
    strategy: ProviderStrategy,
    current_index: AtomicUsize,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, strategy: ProviderStrategy) -> Self {
        let name = providers
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("+");
        Self {
            name,
            providers,
            strategy,
            current_index: AtomicUsize::new(0),
        }
    }

    /// Get the next provider based on strategy
    pub fn next_provider(&self) -> Option<&Arc<dyn LlmProvider>> {
        if self.providers.is_empty() {
            return None;
        }

        let idx = match self.strategy {
            ProviderStrategy::Single => 0,
            ProviderStrategy::RoundRobin => self.current_index.fetch_add(1, Ordering::SeqCst),
            ProviderStrategy::Failover => self.current_index.load(Ordering::SeqCst),
        };
        self.providers.get(idx % self.providers.len())
    }

    /// Advance to next provider (for failover)
    pub fn advance(&self) {
        self.current_index.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for ProviderChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<bool> {
        for provider in &self.providers {
            if provider.health_check().await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ProviderResult> {
        let attempts = if self.strategy == ProviderStrategy::Failover {
            self.providers.len()
        } else {
            1
        };

        let mut last_error = None;
        for _ in 0..attempts {
            let provider = self.next_provider().ok_or_else(|| {
                AgentError::Provider(ProviderFailure::Unavailable("no providers configured".into()))
            })?;
            match provider.send(messages, tools, options).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && self.strategy == ProviderStrategy::Failover => {
                    tracing::warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                    self.advance();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AgentError::Provider(ProviderFailure::Unavailable("all providers failed".into()))
        }))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        for provider in &self.providers {
            models.extend(provider.list_models().await.unwrap_or_default());
        }
        Ok(models)
    }
}
