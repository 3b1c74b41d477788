//! Session Management
//!
//! [`ChatService`] is the façade a presentation layer talks to. It owns the
//! chat sessions and their conversation stores, runs each submitted user
//! turn as its own task, and makes sure at most one turn per session touches
//! the orchestrator at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{ConversationEvent, ConversationStore};
use crate::error::{AgentError, Result};
use crate::message::{Message, MessageId};
use crate::reasoning::{Orchestrator, TurnOutcome};

const TITLE_CHARS: usize = 48;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
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

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens to an in-flight turn when the user submits again
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitPolicy {
    /// Cancel the running turn, then run the new one
    #[default]
    #[serde(rename = "cancel", alias = "cancel_in_flight")]
    CancelInFlight,

    /// Run turns one after another in submission order
    Queue,
}

/// Session summary
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub agent: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    /// A turn is running or waiting
    pub busy: bool,
}

struct Session {
    id: SessionId,
    agent: String,
    created_at: DateTime<Utc>,
    title: RwLock<Option<String>>,
    conversation: Arc<ConversationStore>,
    /// Completion signal of the most recently submitted turn
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    in_flight: Mutex<Vec<(u64, CancellationToken)>>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            agent: self.agent.clone(),
            title: self.title.read().unwrap_or_else(PoisonError::into_inner).clone(),
            created_at: self.created_at,
            message_count: self.conversation.len(),
            busy: !self.lock_in_flight().is_empty(),
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Vec<(u64, CancellationToken)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_all(&self) -> usize {
        let in_flight = self.lock_in_flight();
        for (_, token) in in_flight.iter() {
            token.cancel();
        }
        in_flight.len()
    }

    fn finish_turn(&self, turn: u64) {
        self.lock_in_flight().retain(|(id, _)| *id != turn);
    }

    fn set_title_from(&self, text: &str) {
        let mut title = self.title.write().unwrap_or_else(PoisonError::into_inner);
        if title.is_none() {
            let mut derived: String = text.trim().chars().take(TITLE_CHARS).collect();
            if text.trim().chars().count() > TITLE_CHARS {
                derived.push('…');
            }
            *title = Some(derived);
        }
    }
}

/// A submitted user turn
pub struct TurnHandle {
    /// Conversation events from the moment of submission
    pub events: broadcast::Receiver<ConversationEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<TurnOutcome>>,
}

impl TurnHandle {
    /// Abort this turn and everything it delegated
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the turn to finish
    pub async fn outcome(self) -> Result<TurnOutcome> {
        self.task
            .await
            .map_err(|e| AgentError::Other(format!("turn task failed: {e}")))?
    }
}

/// Message service over a set of chat sessions
pub struct ChatService {
    orchestrator: Orchestrator,
    policy: SubmitPolicy,
    default_agent: String,
    sessions: RwLock<IndexMap<SessionId, Arc<Session>>>,
    next_turn: AtomicU64,
}

impl ChatService {
    pub fn new(
        orchestrator: Orchestrator,
        default_agent: impl Into<String>,
        policy: SubmitPolicy,
    ) -> Result<Self> {
        let default_agent = default_agent.into();
        if orchestrator.roster().get(&default_agent).is_none() {
            return Err(AgentError::Config(format!(
                "default agent '{default_agent}' is not in the roster"
            )));
        }
        Ok(Self {
            orchestrator,
            policy,
            default_agent,
            sessions: RwLock::new(IndexMap::new()),
            next_turn: AtomicU64::new(1),
        })
    }

    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub const fn policy(&self) -> SubmitPolicy {
        self.policy
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// Start a session bound to `agent`, or the default agent
    pub fn create_session(&self, agent: Option<&str>) -> Result<SessionInfo> {
        let agent = agent.unwrap_or(&self.default_agent);
        if self.orchestrator.roster().get(agent).is_none() {
            return Err(AgentError::NotFound(format!("agent '{agent}'")));
        }

        let session = Arc::new(Session {
            id: SessionId::new(),
            agent: agent.to_string(),
            created_at: Utc::now(),
            title: RwLock::new(None),
            conversation: Arc::new(ConversationStore::new()),
            tail: Mutex::new(None),
            in_flight: Mutex::new(Vec::new()),
        });
        tracing::info!(session = %session.id, agent, "session created");

        let info = session.info();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session);
        Ok(info)
    }

    /// Drop a session, cancelling its turns
    pub fn remove_session(&self, id: &SessionId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(id)
            .ok_or_else(|| not_found(id))?;
        let cancelled = session.cancel_all();
        tracing::info!(session = %id, cancelled, "session removed");
        Ok(())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.info())
            .collect()
    }

    pub fn session(&self, id: &SessionId) -> Result<SessionInfo> {
        Ok(self.get(id)?.info())
    }

    /// The session's conversation store
    pub fn conversation(&self, id: &SessionId) -> Result<Arc<ConversationStore>> {
        Ok(Arc::clone(&self.get(id)?.conversation))
    }

    pub fn messages(&self, id: &SessionId) -> Result<Vec<Message>> {
        Ok(self.get(id)?.conversation.snapshot())
    }

    pub fn subscribe(&self, id: &SessionId) -> Result<broadcast::Receiver<ConversationEvent>> {
        Ok(self.get(id)?.conversation.subscribe())
    }

    /// Delete a message and its linked call/result partner. A pending call
    /// among them is cancelled and its result discarded.
    pub fn delete_message(&self, id: &SessionId, message: &MessageId) -> Result<Vec<MessageId>> {
        let removed = self.get(id)?.conversation.delete(message)?;
        tracing::info!(session = %id, removed = removed.len(), "messages deleted");
        Ok(removed)
    }

    /// Cancel every running or waiting turn; returns how many there were
    pub fn cancel(&self, id: &SessionId) -> Result<usize> {
        let cancelled = self.get(id)?.cancel_all();
        if cancelled > 0 {
            tracing::info!(session = %id, cancelled, "turns cancelled");
        }
        Ok(cancelled)
    }

    /// Submit user text as a new turn.
    ///
    /// The turn runs on its own task. Turns of one session run one at a time
    /// in submission order; with [`SubmitPolicy::CancelInFlight`] earlier
    /// turns are cancelled first. A turn that fails or is cancelled after it
    /// started leaves an agent-event message describing why.
    pub fn submit(&self, id: &SessionId, text: impl Into<String>) -> Result<TurnHandle> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(AgentError::Conversation("message text is empty".into()));
        }

        let session = self.get(id)?;
        if self.policy == SubmitPolicy::CancelInFlight {
            let cancelled = session.cancel_all();
            if cancelled > 0 {
                tracing::debug!(session = %id, cancelled, "replacing in-flight turn");
            }
        }
        session.set_title_from(&text);

        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        session.lock_in_flight().push((turn, cancel.clone()));

        let (done, gate) = oneshot::channel::<()>();
        let previous = session
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(gate);

        let events = session.conversation.subscribe();
        let orchestrator = self.orchestrator.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let result = if token.is_cancelled() {
                tracing::debug!(session = %session.id, turn, "turn cancelled before it started");
                Err(AgentError::Cancelled)
            } else {
                let result = orchestrator
                    .run(&session.agent, &session.conversation, Some(text), &token)
                    .await;
                if let Err(e) = &result {
                    tracing::warn!(session = %session.id, turn, kind = e.kind(), error = %e, "turn failed");
                    let event = Message::agent_event(e.user_message()).with_agent(&session.agent);
                    if let Err(append_err) = session.conversation.append(event) {
                        tracing::error!(session = %session.id, error = %append_err, "could not record failure");
                    }
                }
                result
            };

            session.finish_turn(turn);
            drop(done);
            result
        });

        Ok(TurnHandle {
            events,
            cancel,
            task,
        })
    }

    fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &SessionId) -> AgentError {
    AgentError::NotFound(format!("session {id}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::{Agent, AgentRoster};
    use crate::config::OrchestratorConfig;
    use crate::error::ProviderFailure;
    use crate::message::Role;
    use crate::testing::{BlockingTool, Reply, ScriptedProvider};

    fn service(provider: Arc<ScriptedProvider>, policy: SubmitPolicy) -> (ChatService, Arc<tokio::sync::Notify>) {
        let tool = BlockingTool::new();
        let started = tool.started.clone();
        let agent = Agent::builder("chat").provider(provider).tool(tool).build().unwrap();
        let roster = AgentRoster::new().with(agent).unwrap();
        let orchestrator = Orchestrator::new(roster, OrchestratorConfig::default()).unwrap();
        (ChatService::new(orchestrator, "chat", policy).unwrap(), started)
    }

    /// Echoes the last message; a first "block" runs the blocking tool
    fn echo() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::from_fn("echo", |messages, i| {
            let last = messages.last().unwrap();
            match (last.role, last.content()) {
                (Role::User, "block") if i == 0 => Ok(Reply::Calls(vec![ScriptedProvider::call(
                    "block",
                    "b1",
                    json!({}),
                )])),
                (Role::User, "fail") => Err(ProviderFailure::AuthFailure("bad key".into())),
                (_, text) => Ok(Reply::Text(format!("echo: {text}"))),
            }
        }))
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let (service, _) = service(echo(), SubmitPolicy::default());
        let session = service.create_session(None).unwrap();
        assert_eq!(session.agent, "chat");

        let handle = service.submit(&session.id, "hello there").unwrap();
        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.text, "echo: hello there");

        let info = service.session(&session.id).unwrap();
        assert_eq!(info.title.as_deref(), Some("hello there"));
        assert_eq!(info.message_count, 2);
        assert!(!info.busy);
    }

    #[tokio::test]
    async fn test_turn_events_are_streamed() {
        let (service, _) = service(echo(), SubmitPolicy::default());
        let session = service.create_session(None).unwrap();

        let mut handle = service.submit(&session.id, "hi").unwrap();
        let mut roles = Vec::new();
        while roles.len() < 2 {
            if let ConversationEvent::Appended { message } = handle.events.recv().await.unwrap() {
                roles.push(message.role);
            }
        }
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_failed_turn_records_agent_event() {
        let (service, _) = service(echo(), SubmitPolicy::default());
        let session = service.create_session(None).unwrap();

        let err = service.submit(&session.id, "fail").unwrap().outcome().await.unwrap_err();
        assert_eq!(err.kind(), "auth_failure");

        let messages = service.messages(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::AgentEvent);
        assert!(messages[1].content().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_new_submission_cancels_in_flight_turn() {
        let (service, started) = service(echo(), SubmitPolicy::CancelInFlight);
        let session = service.create_session(None).unwrap();

        let first = service.submit(&session.id, "block").unwrap();
        started.notified().await;
        let second = service.submit(&session.id, "next").unwrap();

        assert!(matches!(first.outcome().await, Err(AgentError::Cancelled)));
        assert_eq!(second.outcome().await.unwrap().text, "echo: next");

        let roles: Vec<_> = service
            .messages(&session.id)
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![
                Role::User,
                Role::ToolCall,
                Role::ToolResult,
                Role::AgentEvent,
                Role::User,
                Role::Assistant,
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_policy_runs_turns_in_order() {
        let (service, _) = service(echo(), SubmitPolicy::Queue);
        let session = service.create_session(None).unwrap();

        let first = service.submit(&session.id, "one").unwrap();
        let second = service.submit(&session.id, "two").unwrap();
        assert_eq!(second.outcome().await.unwrap().text, "echo: two");
        assert_eq!(first.outcome().await.unwrap().text, "echo: one");

        let texts: Vec<_> = service
            .messages(&session.id)
            .unwrap()
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(texts, vec!["one", "echo: one", "two", "echo: two"]);
    }

    #[tokio::test]
    async fn test_delete_pending_call_through_service() {
        let (service, started) = service(echo(), SubmitPolicy::default());
        let session = service.create_session(None).unwrap();

        let handle = service.submit(&session.id, "block").unwrap();
        started.notified().await;

        let call = service
            .messages(&session.id)
            .unwrap()
            .into_iter()
            .find(|m| m.role == Role::ToolCall)
            .unwrap();
        let removed = service.delete_message(&session.id, &call.id).unwrap();
        assert_eq!(removed, vec![call.id]);

        // The provider then answers the user message again
        let outcome = handle.outcome().await.unwrap();
        assert_eq!(outcome.text, "echo: block");
        let messages = service.messages(&session.id).unwrap();
        assert!(messages.iter().all(|m| m.role != Role::ToolResult));
    }

    #[tokio::test]
    async fn test_unknown_session_and_agent() {
        let (service, _) = service(echo(), SubmitPolicy::default());
        let missing = SessionId::new();
        assert_eq!(service.submit(&missing, "hi").err().unwrap().kind(), "not_found");
        assert_eq!(service.create_session(Some("ghost")).unwrap_err().kind(), "not_found");
        assert!(service.remove_session(&missing).is_err());
    }

    #[tokio::test]
    async fn test_remove_session_cancels_turns() {
        let (service, started) = service(echo(), SubmitPolicy::default());
        let session = service.create_session(None).unwrap();

        let handle = service.submit(&session.id, "block").unwrap();
        started.notified().await;
        service.remove_session(&session.id).unwrap();

        assert!(matches!(handle.outcome().await, Err(AgentError::Cancelled)));
        assert!(service.sessions().is_empty());
    }

    #[test]
    fn test_policy_names() {
        #[derive(Deserialize)]
        struct Doc {
            policy: SubmitPolicy,
        }
        let doc: Doc = toml::from_str("policy = \"cancel\"").unwrap();
        assert_eq!(doc.policy, SubmitPolicy::CancelInFlight);
        let doc: Doc = toml::from_str("policy = \"queue\"").unwrap();
        assert_eq!(doc.policy, SubmitPolicy::Queue);
    }
}
