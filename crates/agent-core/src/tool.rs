//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered at configuration time and invoked by the
//! [`ToolDispatcher`](crate::dispatch::ToolDispatcher) on behalf of the
//! orchestration loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Arguments, ToolCallRequest};

/// Result from tool execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool that was called
    pub name: String,

    /// Call ID (if provided in request)
    pub id: Option<String>,

    /// Whether execution succeeded
    pub success: bool,

    /// Output (success message or error)
    pub output: String,

    /// Structured data (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn success(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            success: false,
            output: error.into(),
            data: None,
        }
    }

    /// Error payload the provider can read and react to
    pub fn from_error(name: impl Into<String>, error: &AgentError) -> Self {
        Self::failure(name, error.to_string()).with_data(json!({
            "error": {
                "kind": error.kind(),
                "message": error.to_string(),
            }
        }))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Error kind when this result carries an error payload
    pub fn error_kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("error")?.get("kind")?.as_str()
    }

    /// Text fed back to the provider as the tool-result message body
    pub fn render(&self) -> String {
        match (&self.data, self.success) {
            (Some(data), false) => data.to_string(),
            (_, false) => json!({ "error": { "message": self.output } }).to_string(),
            _ => self.output.clone(),
        }
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, integer, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn new(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: false,
            default: None,
            enum_values: None,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.param_type.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        }
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,

    /// Category for grouping
    #[serde(default)]
    pub category: Option<String>,

    /// Whether tool has side effects
    #[serde(default)]
    pub has_side_effects: bool,
}

impl ToolSchema {
    /// JSON Schema object describing the accepted arguments
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = json!({
                "type": param.param_type,
                "description": param.description,
            });
            if let Some(values) = &param.enum_values {
                prop["enum"] = Value::Array(values.clone());
            }
            if let Some(default) = &param.default {
                prop["default"] = default.clone();
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check arguments against the declared parameters
    pub fn validate(&self, arguments: &Arguments) -> Result<()> {
        for param in &self.parameters {
            match arguments.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(AgentError::ToolValidation(format!(
                        "Missing required parameter: {}",
                        param.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !param.accepts(value) {
                        return Err(AgentError::ToolValidation(format!(
                            "Parameter '{}' must be of type {}",
                            param.name, param.param_type
                        )));
                    }
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            return Err(AgentError::ToolValidation(format!(
                                "Parameter '{}' must be one of {}",
                                param.name,
                                Value::Array(allowed.clone())
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Per-invocation context handed to a tool
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Name of the agent whose loop is dispatching
    pub agent: String,

    /// Delegation depth of that loop (0 for the top-level agent)
    pub depth: usize,

    /// Cancelled when the call is deleted or the turn is aborted
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(agent: impl Into<String>, depth: usize, cancel: CancellationToken) -> Self {
        Self {
            agent: agent.into(),
            depth,
            cancel,
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with validated arguments
    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolResult>;

    /// Validate arguments before execution
    fn validate(&self, call: &ToolCallRequest) -> Result<()> {
        self.schema().validate(&call.arguments)
    }

    /// Time budget overriding the dispatcher default
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Ordered name -> tool mapping
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool; names must be unique
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool; names must be unique
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.schema().name;
        if self.tools.contains_key(&name) {
            return Err(AgentError::Config(format!("duplicate tool name: {name}")));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool schemas in registration order
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Render tool schemas as a prompt section for backends without native
/// function calling. Calls are expected back as ```` ```tool ```` blocks.
pub fn render_tool_prompt(schemas: &[ToolSchema]) -> String {
    let mut prompt = String::from("## Available Tools\n\n");
    prompt.push_str("You can use the following tools by responding with a JSON block:\n\n");
    prompt.push_str("```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n");
    prompt.push_str("Emit one block per call. After receiving tool results, answer the user.\n\n");

    for schema in schemas {
        prompt.push_str(&format!("### {}\n{}\n", schema.name, schema.description));

        if !schema.parameters.is_empty() {
            prompt.push_str("**Parameters:**\n");
            for param in &schema.parameters {
                let required = if param.required { " (required)" } else { "" };
                prompt.push_str(&format!(
                    "- `{}` ({}){}: {}\n",
                    param.name, param.param_type, required, param.description
                ));
            }
        }
        prompt.push('\n');
    }

    prompt
}
