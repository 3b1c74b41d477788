//! Scripted providers and tools shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{ProviderFailure, Result};
use crate::message::{Message, ToolCallRequest};
use crate::provider::{GenerationOptions, LlmProvider, ProviderResult, StreamChunk};
use crate::tool::{ParameterSchema, Tool, ToolContext, ToolResult, ToolSchema};

/// Cloneable description of a provider response
#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Calls(Vec<ToolCallRequest>),
    Chunks(Vec<std::result::Result<StreamChunk, ProviderFailure>>),
}

type Script = dyn Fn(&[Message], usize) -> std::result::Result<Reply, ProviderFailure> + Send + Sync;

pub struct ScriptedProvider {
    name: String,
    script: Box<Script>,
    calls: AtomicUsize,
    seen_tools: Mutex<Vec<Vec<String>>>,
    seen_options: Mutex<Vec<GenerationOptions>>,
}

impl ScriptedProvider {
    /// Replay `steps` in order, then answer "done" forever
    pub fn new(steps: Vec<std::result::Result<Reply, ProviderFailure>>) -> Self {
        Self::named("scripted", steps)
    }

    pub fn named(name: &str, steps: Vec<std::result::Result<Reply, ProviderFailure>>) -> Self {
        Self::from_fn(name, move |_, i| {
            steps.get(i).cloned().unwrap_or_else(|| Ok(Reply::Text("done".into())))
        })
    }

    pub fn from_fn<F>(name: &str, script: F) -> Self
    where
        F: Fn(&[Message], usize) -> std::result::Result<Reply, ProviderFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            seen_tools: Mutex::new(Vec::new()),
            seen_options: Mutex::new(Vec::new()),
        }
    }

    pub fn text(text: &str) -> Reply {
        Reply::Text(text.to_string())
    }

    pub fn call(name: &str, id: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::from_value(name, args).unwrap().with_id(id)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tool names offered on each request
    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().unwrap().clone()
    }

    pub fn seen_options(&self) -> Vec<GenerationOptions> {
        self.seen_options.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ProviderResult> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_tools
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.seen_options.lock().unwrap().push(options.clone());

        match (self.script)(messages, index)? {
            Reply::Text(text) => Ok(ProviderResult::FinalMessage(text)),
            Reply::Calls(calls) => Ok(ProviderResult::ToolInvocationRequest(calls)),
            Reply::Chunks(chunks) => {
                let items: Vec<Result<StreamChunk>> =
                    chunks.into_iter().map(|c| c.map_err(Into::into)).collect();
                Ok(ProviderResult::Stream(Box::pin(futures::stream::iter(items))))
            }
        }
    }
}

/// Tool returning a fixed output after an optional delay
pub struct StaticTool {
    pub name: String,
    pub output: String,
    pub delay: Duration,
    pub invocations: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            delay: Duration::ZERO,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: format!("Test tool {}", self.name),
            parameters: vec![ParameterSchema::new("query", "string", "Input").required()],
            category: None,
            has_side_effects: false,
        }
    }

    async fn execute(&self, _call: &ToolCallRequest, _ctx: &ToolContext) -> Result<ToolResult> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ToolResult::success(self.name.clone(), self.output.clone()))
    }
}

/// Tool that never finishes on its own; signals once it has started
pub struct BlockingTool {
    pub started: Arc<Notify>,
}

impl BlockingTool {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "block".into(),
            description: "Waits forever".into(),
            parameters: Vec::new(),
            category: None,
            has_side_effects: false,
        }
    }

    async fn execute(&self, _call: &ToolCallRequest, _ctx: &ToolContext) -> Result<ToolResult> {
        self.started.notify_one();
        std::future::pending().await
    }
}
