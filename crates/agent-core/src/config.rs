//! Configuration
//!
//! Loop limits come from [`OrchestratorConfig`] (defaults, overridable from
//! the environment). Agents are described in a TOML document parsed into
//! [`RosterConfig`] and resolved against a tool catalog and a set of named
//! providers by [`RosterConfig::build_roster`].
//!
//! ```toml
//! default_agent = "assistant"
//! default_provider = "ollama"
//! submit_policy = "cancel"
//!
//! [orchestrator]
//! max_turns = 8
//!
//! [[agent]]
//! name = "assistant"
//! model = "llama3.2"
//! instructions = "You are a helpful assistant."
//! tools = ["datetime", "calculate"]
//! delegates = ["researcher"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::{Agent, AgentRoster};
use crate::error::{AgentError, Result};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::session::SubmitPolicy;
use crate::tool::ToolRegistry;

/// Limits for one orchestration loop and its delegations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Dispatch rounds allowed before `TurnLimitExceeded`
    pub max_turns: usize,

    /// Nested delegation hops allowed below the top-level agent
    pub max_delegation_depth: usize,

    /// Default per-tool time budget
    pub tool_timeout: Duration,

    /// Time budget for a whole delegated sub-loop
    pub delegation_timeout: Duration,

    /// Run the calls of one provider turn concurrently
    pub parallel_tool_calls: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_delegation_depth: 2,
            tool_timeout: Duration::from_secs(30),
            delegation_timeout: Duration::from_secs(300),
            parallel_tool_calls: true,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `AGENT_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `AGENT_*` environment overrides; unparseable values are ignored
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("AGENT_MAX_TURNS") {
            self.max_turns = v;
        }
        if let Some(v) = env_parse("AGENT_MAX_DELEGATION_DEPTH") {
            self.max_delegation_depth = v;
        }
        if let Some(v) = env_parse("AGENT_TOOL_TIMEOUT_SECS") {
            self.tool_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("AGENT_DELEGATION_TIMEOUT_SECS") {
            self.delegation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("AGENT_PARALLEL_TOOL_CALLS") {
            self.parallel_tool_calls = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(AgentError::Config("max_turns must be at least 1".into()));
        }
        if self.tool_timeout.is_zero() || self.delegation_timeout.is_zero() {
            return Err(AgentError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// `[orchestrator]` table; missing keys keep their defaults
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    pub max_turns: Option<usize>,
    pub max_delegation_depth: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub delegation_timeout_secs: Option<u64>,
    pub parallel_tool_calls: Option<bool>,
}

impl OrchestratorSection {
    pub fn apply(&self, mut config: OrchestratorConfig) -> OrchestratorConfig {
        if let Some(v) = self.max_turns {
            config.max_turns = v;
        }
        if let Some(v) = self.max_delegation_depth {
            config.max_delegation_depth = v;
        }
        if let Some(v) = self.tool_timeout_secs {
            config.tool_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.delegation_timeout_secs {
            config.delegation_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.parallel_tool_calls {
            config.parallel_tool_calls = v;
        }
        config
    }
}

/// One `[[agent]]` table
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructions: String,
    pub model: String,
    /// Provider name; falls back to `default_provider`
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub delegates: Vec<String>,
}

/// Parsed agent configuration document
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RosterConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub submit_policy: SubmitPolicy,
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentSpec>,
}

impl FromStr for RosterConfig {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AgentError::Config(format!("invalid agent config: {e}")))
    }
}

impl RosterConfig {
    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = raw.parse()?;
        tracing::debug!(path = %path.display(), agents = config.agents.len(), "loaded agent config");
        Ok(config)
    }

    /// Orchestrator limits: `base` with the `[orchestrator]` table applied
    pub fn orchestrator(&self, base: OrchestratorConfig) -> OrchestratorConfig {
        self.orchestrator.apply(base)
    }

    /// Name of the agent new sessions start with
    pub fn default_agent(&self) -> Option<&str> {
        self.default_agent
            .as_deref()
            .or_else(|| self.agents.first().map(|a| a.name.as_str()))
    }

    /// Resolve every agent against the tool catalog and provider set
    pub fn build_roster(
        &self,
        providers: &HashMap<String, Arc<dyn LlmProvider>>,
        catalog: &ToolRegistry,
    ) -> Result<AgentRoster> {
        let mut roster = AgentRoster::new();

        for spec in &self.agents {
            let provider_name = spec
                .provider
                .as_deref()
                .or(self.default_provider.as_deref())
                .ok_or_else(|| {
                    AgentError::Config(format!(
                        "agent '{}' names no provider and there is no default_provider",
                        spec.name
                    ))
                })?;
            let provider = providers.get(provider_name).cloned().ok_or_else(|| {
                AgentError::Config(format!(
                    "agent '{}' uses unknown provider '{provider_name}'",
                    spec.name
                ))
            })?;

            let mut tools = ToolRegistry::new();
            for tool_name in &spec.tools {
                let tool = catalog.get(tool_name).ok_or_else(|| {
                    AgentError::Config(format!(
                        "agent '{}' uses unknown tool '{tool_name}'",
                        spec.name
                    ))
                })?;
                tools.register_arc(tool).map_err(|_| {
                    AgentError::Config(format!(
                        "agent '{}' lists tool '{tool_name}' twice",
                        spec.name
                    ))
                })?;
            }

            let mut generation = GenerationOptions {
                model: spec.model.clone(),
                stream: spec.stream,
                ..GenerationOptions::default()
            };
            if let Some(t) = spec.temperature {
                generation.temperature = t;
            }
            if let Some(m) = spec.max_tokens {
                generation.max_tokens = m;
            }

            let agent = spec
                .delegates
                .iter()
                .fold(Agent::builder(&spec.name), |b, d| b.delegate(d))
                .description(&spec.description)
                .instructions(&spec.instructions)
                .provider(provider)
                .generation(generation)
                .tools(tools)
                .build()?;
            roster.insert(agent)?;
        }

        roster.validate()?;
        if let Some(name) = &self.default_agent {
            if roster.get(name).is_none() {
                return Err(AgentError::Config(format!("default_agent '{name}' is not defined")));
            }
        }

        tracing::info!(agents = ?roster.names(), "agent roster ready");
        Ok(roster)
    }
}
