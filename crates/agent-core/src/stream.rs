//! Streaming assembly
//!
//! Buffers incremental provider output until the terminal marker. Tool
//! call fragments are only turned into [`ToolCallRequest`]s once the whole
//! call is known and its arguments parse as a JSON object.

use std::collections::BTreeMap;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ProviderFailure, Result};
use crate::message::{ToolCallRequest, new_call_id};
use crate::provider::{CompletionStream, TokenUsage, ToolCallDelta};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates tool call fragments by index
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = &delta.name {
            call.name.push_str(name);
        }
        call.arguments.push_str(&delta.arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete calls in index order; any incomplete call fails the batch
    pub fn finish(self) -> Result<Vec<ToolCallRequest>> {
        self.calls
            .into_values()
            .map(|partial| {
                if partial.name.trim().is_empty() {
                    return Err(malformed("tool call fragment without a name"));
                }
                let raw = partial.arguments.trim();
                let value = if raw.is_empty() {
                    serde_json::Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(raw).map_err(|e| {
                        malformed(&format!("incomplete arguments for '{}': {e}", partial.name))
                    })?
                };
                let call = ToolCallRequest::from_value(partial.name, value)
                    .map_err(|e| malformed(&e))?;
                Ok(call.with_id(partial.id.unwrap_or_else(new_call_id)))
            })
            .collect()
    }
}

fn malformed(msg: &str) -> AgentError {
    AgentError::Provider(ProviderFailure::Malformed(msg.to_string()))
}

/// What a fully consumed stream amounted to
#[derive(Debug)]
pub struct CollectedStream {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

/// Drain a completion stream, reporting text deltas through `on_text`.
///
/// Fails with `Unavailable` if the stream ends before its `done` chunk and
/// with `Cancelled` if `cancel` fires first.
pub async fn collect_stream<F>(
    mut stream: CompletionStream,
    cancel: &CancellationToken,
    mut on_text: F,
) -> Result<CollectedStream>
where
    F: FnMut(&str),
{
    let mut text = String::new();
    let mut assembler = ToolCallAssembler::new();
    let mut usage = None;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AgentError::Cancelled),
            next = stream.next() => next,
        };

        let Some(chunk) = next else {
            return Err(AgentError::Provider(ProviderFailure::Unavailable(
                "stream closed before completion".into(),
            )));
        };
        let chunk = chunk?;

        if !chunk.delta.is_empty() {
            on_text(&chunk.delta);
            text.push_str(&chunk.delta);
        }
        for delta in &chunk.tool_calls {
            assembler.push(delta);
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.done {
            break;
        }
    }

    Ok(CollectedStream {
        text,
        tool_calls: assembler.finish()?,
        usage,
    })
}
