//! Orchestration Loop
//!
//! Drives one request-to-resolution cycle for an agent: query the bound
//! provider with the conversation and the agent's effective tools, then
//! either finish with the assistant's text or dispatch the requested tool
//! calls and query again.
//!
//! Delegate agents are exposed to the provider as pseudo-tools. Invoking one
//! runs a nested loop on a fresh sub-conversation seeded with only the
//! delegation request; its final text becomes the parent's tool result.
//!
//! ```text
//! Start ─► Query ─► FinalMessage ─────────────────► Done
//!            ▲   └► ToolInvocationRequest ─► Dispatch
//!            └──────────── turn < max_turns ◄───┘ └► Failed(TurnLimitExceeded)
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentRoster, DELEGATE_REQUEST_PARAM};
use crate::config::OrchestratorConfig;
use crate::conversation::ConversationStore;
use crate::dispatch::ToolDispatcher;
use crate::error::{AgentError, ProviderFailure, Result};
use crate::message::{new_call_id, Message, MessageId, ToolCallRequest};
use crate::provider::ProviderResult;
use crate::stream::collect_stream;
use crate::tool::{Tool, ToolContext, ToolRegistry, ToolResult, ToolSchema};

/// A loop invocation that reached `Done`
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Agent that produced the final text
    pub agent: String,
    pub text: String,
    /// Dispatch rounds it took
    pub turns: usize,
    /// ID of the appended assistant message
    pub message_id: MessageId,
}

struct Inner {
    roster: AgentRoster,
    config: OrchestratorConfig,
    dispatcher: ToolDispatcher,
}

/// Runs agents from a roster against conversation stores
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.inner.roster.names())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(roster: AgentRoster, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        roster.validate()?;
        let dispatcher = ToolDispatcher::new(config.tool_timeout);
        Ok(Self {
            inner: Arc::new(Inner {
                roster,
                config,
                dispatcher,
            }),
        })
    }

    pub fn roster(&self) -> &AgentRoster {
        &self.inner.roster
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Run `agent` to completion, appending `user_text` first if given.
    ///
    /// Loop-level failures are returned; every message appended before the
    /// failure stays in `store`.
    pub async fn run(
        &self,
        agent: &str,
        store: &ConversationStore,
        user_text: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let agent = self
            .inner
            .roster
            .get(agent)
            .ok_or_else(|| AgentError::Config(format!("unknown agent: {agent}")))?;
        self.run_at_depth(agent, store, user_text, cancel, 0).await
    }

    /// The agent's own tools plus one delegation tool per delegate
    pub fn effective_tools(&self, agent: &Arc<Agent>) -> Result<ToolRegistry> {
        let mut tools = agent.tools().clone();
        for delegate in self.inner.roster.delegates_of(agent)? {
            let name = delegate.name().to_string();
            tools
                .register(DelegateTool {
                    orchestrator: self.clone(),
                    agent: delegate,
                    timeout: self.inner.config.delegation_timeout,
                })
                .map_err(|_| {
                    AgentError::Config(format!(
                        "agent '{}': delegate '{name}' collides with a tool",
                        agent.name()
                    ))
                })?;
        }
        Ok(tools)
    }

    async fn run_at_depth(
        &self,
        agent: Arc<Agent>,
        store: &ConversationStore,
        user_text: Option<String>,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<TurnOutcome> {
        if let Some(text) = user_text {
            store.append(Message::user(text))?;
        }

        let tools = self.effective_tools(&agent)?;
        let schemas = tools.schemas();
        let options = agent.generation_options();
        let max_turns = self.inner.config.max_turns;
        let mut turn = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let snapshot = store.snapshot();
            tracing::debug!(
                agent = agent.name(),
                turn,
                depth,
                messages = snapshot.len(),
                "querying provider"
            );

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = agent.provider().send(&snapshot, &schemas, &options) => result?,
            };

            let (text, calls) = match result {
                ProviderResult::FinalMessage(text) => (text, Vec::new()),
                ProviderResult::ToolInvocationRequest(calls) if calls.is_empty() => {
                    return Err(AgentError::Provider(ProviderFailure::Malformed(
                        "tool invocation request without calls".into(),
                    )));
                }
                ProviderResult::ToolInvocationRequest(calls) => (String::new(), calls),
                ProviderResult::Stream(stream) => {
                    let collected = collect_stream(stream, cancel, |delta| {
                        store.publish_delta(agent.name(), delta);
                    })
                    .await?;
                    if let Some(usage) = &collected.usage {
                        tracing::debug!(
                            agent = agent.name(),
                            turn,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "stream usage"
                        );
                    }
                    (collected.text, collected.tool_calls)
                }
            };

            if calls.is_empty() {
                let message_id = store.append(Message::assistant(&text).with_agent(agent.name()))?;
                tracing::info!(agent = agent.name(), turns = turn, depth, "turn complete");
                return Ok(TurnOutcome {
                    agent: agent.name().to_string(),
                    text,
                    turns: turn,
                    message_id,
                });
            }

            if !text.trim().is_empty() {
                tracing::debug!(agent = agent.name(), "dropping text that accompanied tool calls");
            }

            self.dispatch_round(&agent, &tools, store, calls, cancel, depth)
                .await?;

            turn += 1;
            if turn >= max_turns {
                tracing::warn!(agent = agent.name(), depth, max_turns, "turn limit reached");
                return Err(AgentError::TurnLimitExceeded(max_turns));
            }
        }
    }

    /// Append the calls, run them, and append their results in request order
    async fn dispatch_round(
        &self,
        agent: &Agent,
        tools: &ToolRegistry,
        store: &ConversationStore,
        calls: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
        depth: usize,
    ) -> Result<()> {
        let calls = unique_call_ids(store, calls);
        let mut contexts = Vec::with_capacity(calls.len());
        for call in &calls {
            store.append(Message::tool_call(call.clone()).with_agent(agent.name()))?;
            let token = cancel.child_token();
            store.track_cancellation(&call.id, token.clone());
            contexts.push(ToolContext::new(agent.name(), depth, token));
        }

        let dispatcher = &self.inner.dispatcher;
        let results: Vec<ToolResult> = if self.inner.config.parallel_tool_calls {
            join_all(
                calls
                    .iter()
                    .zip(&contexts)
                    .map(|(call, ctx)| dispatcher.invoke(call, tools, ctx)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for (call, ctx) in calls.iter().zip(&contexts) {
                results.push(dispatcher.invoke(call, tools, ctx).await);
            }
            results
        };

        for (call, result) in calls.iter().zip(results) {
            match store.append(Message::tool_result(&result).with_agent(agent.name())) {
                Ok(_) => {}
                // The call was deleted while running
                Err(AgentError::Conversation(reason)) => {
                    tracing::warn!(
                        agent = agent.name(),
                        tool = %call.name,
                        call_id = %call.id,
                        %reason,
                        "discarding tool result"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }
}

/// Give a fresh ID to every call whose ID is blank, already in `store`, or
/// repeated earlier in the batch. Some backends number calls per response.
fn unique_call_ids(store: &ConversationStore, calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::with_capacity(calls.len());
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || store.knows_call(&call.id) || !seen.insert(call.id.clone()) {
                let fresh = new_call_id();
                tracing::debug!(tool = %call.name, from = %call.id, to = %fresh, "re-keying tool call");
                seen.insert(fresh.clone());
                call.id = fresh;
            }
            call
        })
        .collect()
}

/// Exposes a delegate agent through the [`Tool`] contract
struct DelegateTool {
    orchestrator: Orchestrator,
    agent: Arc<Agent>,
    timeout: Duration,
}

#[async_trait]
impl Tool for DelegateTool {
    fn schema(&self) -> ToolSchema {
        self.agent.as_tool_descriptor()
    }

    async fn execute(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<ToolResult> {
        let depth = ctx.depth + 1;
        let max = self.orchestrator.config().max_delegation_depth;
        if depth > max {
            return Err(AgentError::DelegationDepthExceeded { depth, max });
        }

        let request = call
            .arguments
            .get(DELEGATE_REQUEST_PARAM)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        tracing::info!(from = %ctx.agent, to = self.agent.name(), depth, "delegating");
        let sub_conversation = ConversationStore::new();
        let outcome = self
            .orchestrator
            .run_at_depth(
                Arc::clone(&self.agent),
                &sub_conversation,
                Some(request),
                &ctx.cancel,
                depth,
            )
            .await?;

        Ok(ToolResult::success(self.agent.name(), outcome.text).with_data(json!({
            "agent": outcome.agent,
            "turns": outcome.turns,
        })))
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }
}
