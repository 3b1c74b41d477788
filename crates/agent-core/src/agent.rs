//! Agents
//!
//! An [`Agent`] is a named persona bound to one provider and model, with
//! instructions, its own tools and an ordered list of delegate agents. Agents
//! are immutable once built; an [`AgentRoster`] holds the set a conversation
//! may use and resolves delegates by name, which is what lets two agents
//! delegate to each other.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{AgentError, Result};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::tool::{ParameterSchema, Tool, ToolRegistry, ToolSchema};

/// Argument carrying the delegated task
pub const DELEGATE_REQUEST_PARAM: &str = "request";

/// Configured persona
pub struct Agent {
    name: String,
    description: String,
    instructions: String,
    provider: Arc<dyn LlmProvider>,
    generation: GenerationOptions,
    tools: ToolRegistry,
    delegates: Vec<String>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.generation.model)
            .field("tools", &self.tools)
            .field("delegates", &self.delegates)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn model(&self) -> &str {
        &self.generation.model
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Directly registered tools
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Delegate agent names, in declaration order
    pub fn delegates(&self) -> &[String] {
        &self.delegates
    }

    /// Generation options for a request, instructions as the system prompt
    pub fn generation_options(&self) -> GenerationOptions {
        let mut options = self.generation.clone();
        if !self.instructions.is_empty() {
            options.system_prompt = Some(self.instructions.clone());
        }
        options
    }

    /// Describe this agent as a pseudo-tool a parent agent can call
    pub fn as_tool_descriptor(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: if self.description.is_empty() {
                format!("Hand a task to the '{}' agent", self.name)
            } else {
                self.description.clone()
            },
            parameters: vec![
                ParameterSchema::new(
                    DELEGATE_REQUEST_PARAM,
                    "string",
                    "Self-contained description of the task for this agent",
                )
                .required(),
            ],
            category: Some("agent".into()),
            has_side_effects: false,
        }
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    name: String,
    description: String,
    instructions: String,
    provider: Option<Arc<dyn LlmProvider>>,
    generation: GenerationOptions,
    tools: ToolRegistry,
    delegates: Vec<String>,
    /// Tool names registered more than once
    duplicate_tools: Vec<String>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            provider: None,
            generation: GenerationOptions::default(),
            tools: ToolRegistry::new(),
            delegates: Vec::new(),
            duplicate_tools: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.generation.model = model.into();
        self
    }

    pub const fn temperature(mut self, temp: f32) -> Self {
        self.generation.temperature = temp;
        self
    }

    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.generation.max_tokens = max_tokens;
        self
    }

    pub const fn stream(mut self, stream: bool) -> Self {
        self.generation.stream = stream;
        self
    }

    pub fn generation(mut self, generation: GenerationOptions) -> Self {
        self.generation = generation;
        self
    }

    /// Add a tool; `build` fails if another tool already has its name
    pub fn tool<T: Tool + 'static>(self, tool: T) -> Self {
        self.tool_arc(Arc::new(tool))
    }

    pub fn tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.schema().name;
        if self.tools.register_arc(tool).is_err() {
            self.duplicate_tools.push(name);
        }
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn delegate(mut self, agent: impl Into<String>) -> Self {
        self.delegates.push(agent.into());
        self
    }

    pub fn build(self) -> Result<Agent> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Config("agent name must not be empty".into()));
        }
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config(format!("agent '{}' has no provider", self.name)))?;

        if let Some(tool) = self.duplicate_tools.first() {
            return Err(AgentError::Config(format!(
                "agent '{}' lists tool '{tool}' twice",
                self.name
            )));
        }

        for (i, delegate) in self.delegates.iter().enumerate() {
            if self.delegates[..i].contains(delegate) {
                return Err(AgentError::Config(format!(
                    "agent '{}' lists delegate '{delegate}' twice",
                    self.name
                )));
            }
            if self.tools.contains(delegate) {
                return Err(AgentError::Config(format!(
                    "agent '{}': delegate '{delegate}' collides with a tool of the same name",
                    self.name
                )));
            }
        }

        Ok(Agent {
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            provider,
            generation: self.generation,
            tools: self.tools,
            delegates: self.delegates,
        })
    }
}

/// The agents available to a conversation, keyed by name
#[derive(Debug, Default)]
pub struct AgentRoster {
    agents: IndexMap<String, Arc<Agent>>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent: Agent) -> Result<()> {
        if self.agents.contains_key(agent.name()) {
            return Err(AgentError::Config(format!("duplicate agent name: {}", agent.name())));
        }
        self.agents.insert(agent.name().to_string(), Arc::new(agent));
        Ok(())
    }

    pub fn with(mut self, agent: Agent) -> Result<Self> {
        self.insert(agent)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Resolve an agent's delegates, in declaration order
    pub fn delegates_of(&self, agent: &Agent) -> Result<Vec<Arc<Agent>>> {
        agent
            .delegates()
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    AgentError::Config(format!(
                        "agent '{}' delegates to unknown agent '{name}'",
                        agent.name()
                    ))
                })
            })
            .collect()
    }

    /// Every delegate must name an agent in this roster
    pub fn validate(&self) -> Result<()> {
        for agent in self.agents.values() {
            self.delegates_of(agent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProvider, StaticTool};

    fn provider() -> Arc<dyn LlmProvider> {
        Arc::new(ScriptedProvider::new(vec![]))
    }

    #[test]
    fn test_builder_requires_provider() {
        assert!(Agent::builder("a").build().is_err());
        let agent = Agent::builder("a")
            .provider(provider())
            .model("m")
            .instructions("be brief")
            .build()
            .unwrap();
        assert_eq!(agent.model(), "m");
        assert_eq!(agent.generation_options().system_prompt.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_delegate_colliding_with_tool_is_rejected() {
        let result = Agent::builder("a")
            .provider(provider())
            .tool(StaticTool::new("search", "y"))
            .delegate("search")
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_duplicate_tool_is_rejected() {
        let result = Agent::builder("a")
            .provider(provider())
            .tool(StaticTool::new("search", "y"))
            .tool(StaticTool::new("search", "z"))
            .build();
        let Err(AgentError::Config(reason)) = result else {
            panic!("expected a config error");
        };
        assert!(reason.contains("'search'"));
    }

    #[test]
    fn test_roster_validates_delegates() {
        let a = Agent::builder("a").provider(provider()).delegate("b").build().unwrap();
        let roster = AgentRoster::new().with(a).unwrap();
        assert!(roster.validate().is_err());

        let b = Agent::builder("b").provider(provider()).delegate("a").build().unwrap();
        let roster = roster.with(b).unwrap();
        assert!(roster.validate().is_ok());
        assert_eq!(roster.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_agent_names() {
        let roster = AgentRoster::new()
            .with(Agent::builder("a").provider(provider()).build().unwrap())
            .unwrap();
        assert!(roster.with(Agent::builder("a").provider(provider()).build().unwrap()).is_err());
    }

    #[test]
    fn test_tool_descriptor() {
        let agent = Agent::builder("researcher")
            .description("Finds facts")
            .provider(provider())
            .build()
            .unwrap();
        let schema = agent.as_tool_descriptor();
        assert_eq!(schema.name, "researcher");
        assert_eq!(schema.description, "Finds facts");
        assert!(schema.parameters[0].required);
        assert_eq!(schema.parameters[0].name, DELEGATE_REQUEST_PARAM);
    }
}
