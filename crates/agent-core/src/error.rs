//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Provider-agnostic failure reported by an LLM backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Backend asked us to slow down (HTTP 429 and friends)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Credentials missing or rejected
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Response could not be understood
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Backend unreachable, overloaded or dropped the connection
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderFailure {
    /// Everything except an authentication failure may succeed on retry.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthFailure(_))
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::AuthFailure(_) => "auth_failure",
            Self::Malformed(_) => "malformed",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Map an HTTP status code onto a failure category.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => Self::RateLimited(body),
            401 | 403 => Self::AuthFailure(body),
            400..=499 => Self::Malformed(format!("HTTP {status}: {body}")),
            _ => Self::Unavailable(format!("HTTP {status}: {body}")),
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderFailure),

    /// Tool not found in the active agent's effective tool set
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments did not match the declared schema
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool did not finish within its time budget
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Nested delegation went deeper than allowed
    #[error("Delegation depth exceeded: depth {depth} (max: {max})")]
    DelegationDepthExceeded { depth: usize, max: usize },

    /// Maximum turns reached in the orchestration loop
    #[error("Maximum turns ({0}) reached")]
    TurnLimitExceeded(usize),

    /// Work was cancelled before it completed
    #[error("Cancelled")]
    Cancelled,

    /// Conversation history rejected an operation
    #[error("Conversation error: {0}")]
    Conversation(String),

    /// Unknown session or message
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(failure) => failure.is_retryable(),
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Failures that are fed back to the model as a tool result instead of
    /// ending the loop.
    pub const fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool(_)
                | Self::ToolValidation(_)
                | Self::ToolTimeout { .. }
                | Self::ToolExecution(_)
                | Self::DelegationDepthExceeded { .. }
        )
    }

    /// Stable snake_case code for payloads and API bodies
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Provider(failure) => failure.kind(),
            Self::UnknownTool(_) => "unknown_tool",
            Self::ToolValidation(_) => "tool_validation_error",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::ToolExecution(_) => "tool_execution_error",
            Self::DelegationDepthExceeded { .. } => "delegation_depth_exceeded",
            Self::TurnLimitExceeded(_) => "turn_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::Conversation(_) => "conversation_error",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Other(_) => "other",
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(ProviderFailure::RateLimited(_)) => {
                "You've made too many requests. Please wait a moment.".into()
            }
            Self::Provider(ProviderFailure::AuthFailure(_)) => {
                "Authentication failed. Please check your credentials.".into()
            }
            Self::Provider(ProviderFailure::Unavailable(_)) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::Provider(ProviderFailure::Malformed(msg)) => {
                format!("The AI service returned an unexpected response: {msg}")
            }
            Self::UnknownTool(name) => format!("The tool '{name}' is not available."),
            Self::ToolValidation(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolTimeout { tool, .. } => format!("The tool '{tool}' took too long."),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::DelegationDepthExceeded { .. } => {
                "Too many nested hand-offs between agents.".into()
            }
            Self::TurnLimitExceeded(_) => {
                "The request took too long to process. Please try a simpler query.".into()
            }
            Self::Cancelled => "The request was cancelled.".into(),
            Self::Conversation(msg) => format!("Conversation error: {msg}"),
            Self::NotFound(what) => format!("{what} does not exist."),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_is_not_retryable() {
        assert!(!AgentError::from(ProviderFailure::AuthFailure("bad key".into())).is_retryable());
        assert!(AgentError::from(ProviderFailure::RateLimited("slow".into())).is_retryable());
        assert!(AgentError::from(ProviderFailure::Unavailable("down".into())).is_retryable());
        assert!(!AgentError::TurnLimitExceeded(3).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProviderFailure::from_status(429, "x").kind(), "rate_limited");
        assert_eq!(ProviderFailure::from_status(401, "x").kind(), "auth_failure");
        assert_eq!(ProviderFailure::from_status(403, "x").kind(), "auth_failure");
        assert_eq!(ProviderFailure::from_status(422, "x").kind(), "malformed");
        assert_eq!(ProviderFailure::from_status(503, "x").kind(), "unavailable");
    }

    #[test]
    fn test_tool_level_classification() {
        assert!(AgentError::UnknownTool("x".into()).is_tool_level());
        assert!(AgentError::DelegationDepthExceeded { depth: 3, max: 2 }.is_tool_level());
        assert!(!AgentError::TurnLimitExceeded(10).is_tool_level());
        assert!(!AgentError::from(ProviderFailure::Malformed("?".into())).is_tool_level());
    }
}
