//! Conversation Messages
//!
//! Standard message format used across the agent system. A message is
//! immutable once appended to a [`ConversationStore`](crate::conversation::ConversationStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolResult;

/// Structured tool arguments
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// Role of a message in the conversation log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User input
    User,
    /// Assistant (LLM) text
    Assistant,
    /// A tool invocation requested by the provider
    ToolCall,
    /// The outcome of a tool invocation
    ToolResult,
    /// Bookkeeping produced by the orchestration layer itself
    AgentEvent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::AgentEvent => write!(f, "agent_event"),
        }
    }
}

/// Unique message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call ID, links the eventual tool-result back to this request
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub arguments: Arguments,
}

impl ToolCallRequest {
    /// Create a request with a freshly generated call ID
    pub fn new(name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Build from a JSON value, which must be an object (or null)
    pub fn from_value(
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> std::result::Result<Self, String> {
        match value {
            serde_json::Value::Object(arguments) => Ok(Self::new(name, arguments)),
            serde_json::Value::Null => Ok(Self::new(name, Arguments::new())),
            other => Err(format!("tool arguments must be a JSON object, got {other}")),
        }
    }
}

/// Generate an ID for a tool call the backend did not name itself
pub fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier
    #[serde(default)]
    pub id: MessageId,

    /// Message role
    pub role: Role,

    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Requested tool calls (tool-call messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// Originating call (tool-result messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Whether a tool-result carries an error payload
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Agent that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, text: Option<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            text,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            agent: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Some(text.into()))
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(text.into()))
    }

    /// Create a tool-call message for a single request
    pub fn tool_call(call: ToolCallRequest) -> Self {
        let mut msg = Self::new(Role::ToolCall, None);
        msg.tool_calls.push(call);
        msg
    }

    /// Create a tool-result message from a dispatch outcome
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::new(Role::ToolResult, Some(result.render()));
        msg.tool_call_id.clone_from(&result.id);
        msg.is_error = !result.success;
        msg
    }

    /// Create an orchestration bookkeeping message
    pub fn agent_event(text: impl Into<String>) -> Self {
        Self::new(Role::AgentEvent, Some(text.into()))
    }

    /// Tag the producing agent
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Text content or the empty string
    pub fn content(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}
