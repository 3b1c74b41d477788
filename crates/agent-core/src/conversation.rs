//! Conversation Store
//!
//! Ordered, append-only history for one chat session. The store is the only
//! mutable state shared between the message service and the orchestration
//! loop: readers take snapshots, writers go through [`ConversationStore::append`]
//! and [`ConversationStore::delete`], and no lock is held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Message, MessageId, Role};

const EVENT_CAPACITY: usize = 256;

/// Change notification for subscribers
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// A message was appended
    Appended { message: Message },
    /// Messages were removed
    Deleted { ids: Vec<MessageId> },
    /// Streamed text fragment; never stored
    Delta { agent: String, text: String },
}

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    /// call id -> cancellation hook, for calls without a result yet
    pending: HashMap<String, Option<CancellationToken>>,
    /// call ids that already have their result
    resolved: HashSet<String>,
}

impl State {
    fn known_call(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.resolved.contains(id)
    }

    fn validate(&self, message: &Message) -> Result<()> {
        match message.role {
            Role::ToolCall => {
                if message.tool_calls.is_empty() {
                    return Err(AgentError::Conversation(
                        "tool-call message carries no calls".into(),
                    ));
                }
                let mut seen = HashSet::new();
                for call in &message.tool_calls {
                    if self.known_call(&call.id) || !seen.insert(call.id.as_str()) {
                        return Err(AgentError::Conversation(format!(
                            "duplicate tool call id: {}",
                            call.id
                        )));
                    }
                }
            }
            Role::ToolResult => {
                let Some(call_id) = message.tool_call_id.as_deref() else {
                    return Err(AgentError::Conversation(
                        "tool-result message has no tool_call_id".into(),
                    ));
                };
                if self.resolved.contains(call_id) {
                    return Err(AgentError::Conversation(format!(
                        "tool call {call_id} already has a result"
                    )));
                }
                if !self.pending.contains_key(call_id) {
                    return Err(AgentError::Conversation(format!(
                        "no pending tool call {call_id}"
                    )));
                }
            }
            Role::User | Role::Assistant | Role::AgentEvent => {}
        }
        Ok(())
    }

    /// Call ids a message participates in
    fn linked_calls(message: &Message) -> Vec<&str> {
        match message.role {
            Role::ToolCall => message.tool_calls.iter().map(|c| c.id.as_str()).collect(),
            Role::ToolResult => message.tool_call_id.as_deref().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Thread-safe conversation history with pairing invariants
pub struct ConversationStore {
    state: RwLock<State>,
    events: broadcast::Sender<ConversationEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    /// Append a message, enforcing the tool-call/tool-result pairing.
    ///
    /// On error the store is left untouched.
    pub fn append(&self, message: Message) -> Result<MessageId> {
        let id = message.id.clone();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.messages.iter().any(|m| m.id == id) {
                return Err(AgentError::Conversation(format!("duplicate message id: {id}")));
            }
            state.validate(&message)?;

            match message.role {
                Role::ToolCall => {
                    for call in &message.tool_calls {
                        state.pending.insert(call.id.clone(), None);
                    }
                }
                Role::ToolResult => {
                    if let Some(call_id) = message.tool_call_id.clone() {
                        state.pending.remove(&call_id);
                        state.resolved.insert(call_id);
                    }
                }
                _ => {}
            }
            state.messages.push(message.clone());
        }

        tracing::trace!(message = %id, role = %message.role, "appended message");
        let _ = self.events.send(ConversationEvent::Appended { message });
        Ok(id)
    }

    /// Attach a cancellation token to a pending call.
    ///
    /// Returns `false` and cancels the token right away when the call is no
    /// longer pending.
    pub fn track_cancellation(&self, call_id: &str, token: CancellationToken) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = state.pending.get_mut(call_id) {
            *slot = Some(token);
            true
        } else {
            token.cancel();
            false
        }
    }

    /// Delete a message together with every message linked to it through a
    /// tool-call id. Pending calls among them are cancelled.
    pub fn delete(&self, id: &MessageId) -> Result<Vec<MessageId>> {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(root) = state.messages.iter().find(|m| &m.id == id) else {
                return Err(AgentError::NotFound(format!("message {id}")));
            };

            let mut calls: HashSet<String> =
                State::linked_calls(root).into_iter().map(str::to_string).collect();
            let mut doomed: HashSet<MessageId> = HashSet::from([id.clone()]);

            // Grow until every removed message's partners are removed too
            loop {
                let before = (doomed.len(), calls.len());
                for message in &state.messages {
                    let links = State::linked_calls(message);
                    if doomed.contains(&message.id) || links.iter().any(|c| calls.contains(*c)) {
                        doomed.insert(message.id.clone());
                        calls.extend(links.into_iter().map(str::to_string));
                    }
                }
                if (doomed.len(), calls.len()) == before {
                    break;
                }
            }

            for call_id in &calls {
                if let Some(Some(token)) = state.pending.remove(call_id) {
                    tracing::debug!(call_id = %call_id, "cancelling pending tool call");
                    token.cancel();
                }
                state.resolved.remove(call_id);
            }

            let mut removed = Vec::with_capacity(doomed.len());
            state.messages.retain(|m| {
                if doomed.contains(&m.id) {
                    removed.push(m.id.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };

        let _ = self.events.send(ConversationEvent::Deleted { ids: removed.clone() });
        Ok(removed)
    }

    /// Publish a transient event (streamed text) to subscribers
    pub fn publish_delta(&self, agent: &str, text: &str) {
        let _ = self.events.send(ConversationEvent::Delta {
            agent: agent.to_string(),
            text: text.to_string(),
        });
    }

    /// Copy of the current history
    pub fn snapshot(&self) -> Vec<Message> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).messages.clone()
    }

    /// Look up a message by ID
    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    /// Whether a call still awaits its result
    pub fn is_pending(&self, call_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .contains_key(call_id)
    }

    /// Whether a call with this ID was already appended and not deleted
    pub fn knows_call(&self, call_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .known_call(call_id)
    }

    /// IDs of calls still awaiting a result
    pub fn pending_calls(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| state.pending.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Subscribe to appends, deletions and streamed deltas
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
