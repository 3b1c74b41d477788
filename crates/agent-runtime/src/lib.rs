//! # agent-runtime
//!
//! Concrete provider clients and network-backed tools for agent-core.
//!
//! ## Providers
//!
//! - **Ollama** (`ollama`, default): local inference via Ollama
//! - **OpenAI-compatible** (`openai`, default): any `/chat/completions`
//!   endpoint with native function calling and SSE streaming
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::ollama::OllamaProvider;
//!
//! let provider = OllamaProvider::new("http://localhost", 11434);
//! let agent = AgentBuilder::new("assistant")
//!     .provider(Arc::new(provider))
//!     .model("llama3.2")
//!     .build()?;
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "openai")]
pub mod openai;

pub mod web_search;

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;

#[cfg(feature = "openai")]
pub use openai::{OpenAiConfig, OpenAiProvider};

pub use web_search::WebSearchTool;

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentBuilder, AgentError, LlmProvider, Message, Result, Role, Tool, ToolRegistry,
};
