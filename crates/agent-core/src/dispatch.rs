//! Tool Dispatcher
//!
//! Resolves a [`ToolCallRequest`] against an agent's effective tool set,
//! validates its arguments and runs it under a timeout. Every failure comes
//! back as an error-carrying [`ToolResult`] so the model can react to it;
//! nothing here aborts the orchestration loop.

use std::time::Duration;

use crate::error::AgentError;
use crate::message::ToolCallRequest;
use crate::tool::{ToolContext, ToolRegistry, ToolResult};

#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    default_timeout: Duration,
}

impl ToolDispatcher {
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Invoke one call. The returned result always carries the call's ID.
    pub async fn invoke(
        &self,
        call: &ToolCallRequest,
        tools: &ToolRegistry,
        ctx: &ToolContext,
    ) -> ToolResult {
        let fail = |error: AgentError| {
            tracing::warn!(
                agent = %ctx.agent,
                tool = %call.name,
                call_id = %call.id,
                kind = error.kind(),
                error = %error,
                "tool call failed"
            );
            ToolResult::from_error(call.name.clone(), &error).with_id(call.id.clone())
        };

        let Some(tool) = tools.get(&call.name) else {
            return fail(AgentError::UnknownTool(call.name.clone()));
        };

        if let Err(e) = tool.validate(call) {
            return fail(e);
        }

        if ctx.cancel.is_cancelled() {
            return fail(AgentError::Cancelled);
        }

        let timeout = tool.timeout().unwrap_or(self.default_timeout);
        tracing::debug!(
            agent = %ctx.agent,
            tool = %call.name,
            call_id = %call.id,
            depth = ctx.depth,
            "dispatching tool call"
        );

        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(timeout, tool.execute(call, ctx)) => match result {
                Ok(inner) => inner,
                Err(_) => Err(AgentError::ToolTimeout {
                    tool: call.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        };

        match outcome {
            Ok(mut result) => {
                result.id = Some(call.id.clone());
                result.name.clone_from(&call.name);
                result
            }
            Err(e) => fail(e),
        }
    }
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
