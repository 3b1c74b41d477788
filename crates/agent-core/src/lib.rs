//! # agent-core
//!
//! Provider-agnostic agent/tool orchestration: agents bound to LLM providers,
//! schema-described tools, delegation between agents and the conversation
//! loop that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ ChatService (sessions, one turn at a time per session)           │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │ Orchestrator                                              │   │
//! │  │  ┌─────────────┐  ┌────────────────┐  ┌───────────────┐  │   │
//! │  │  │ Agent       │──│ ToolDispatcher │──│ LlmProvider   │  │   │
//! │  │  │ + delegates │  │ + DelegateTool │  │ (Strategy)    │  │   │
//! │  │  └─────────────┘  └────────────────┘  └───────────────┘  │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                ConversationStore (append / delete)               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between Ollama, OpenAI-compatible
//! endpoints or any other backend without changing agent logic.

pub mod agent;
pub mod builtin;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod retry;
pub mod session;
pub mod stream;
pub mod tool;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentBuilder, AgentRoster};
pub use config::{OrchestratorConfig, RosterConfig};
pub use conversation::{ConversationEvent, ConversationStore};
pub use error::{AgentError, ProviderFailure, Result};
pub use message::{Message, MessageId, Role, ToolCallRequest};
pub use provider::{GenerationOptions, LlmProvider, ProviderResult};
pub use reasoning::{Orchestrator, TurnOutcome};
pub use session::{ChatService, SessionId, SessionInfo, SubmitPolicy, TurnHandle};
pub use tool::{Tool, ToolContext, ToolRegistry, ToolResult, ToolSchema};
