//! HTTP/WebSocket Handlers

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

use agent_core::{AgentError, ConversationEvent, Message, MessageId, SessionId, SessionInfo};

use crate::state::AppState;

// ============================================================================
// Errors
// ============================================================================

/// Error returned by every fallible handler.
///
/// The body is `{"error": {"kind": ..., "message": ...}}`, with `kind` the
/// same stable code tool results carry.
#[derive(Debug)]
pub enum ApiError {
    Agent(AgentError),
    BadRequest(String),
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self::Agent(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Agent(err) => match err {
                AgentError::NotFound(_) => StatusCode::NOT_FOUND,
                AgentError::Config(_)
                | AgentError::Conversation(_)
                | AgentError::ToolValidation(_)
                | AgentError::Json(_) => StatusCode::BAD_REQUEST,
                AgentError::Cancelled => StatusCode::CONFLICT,
                AgentError::Provider(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> serde_json::Value {
        let (kind, message) = match self {
            Self::BadRequest(msg) => ("bad_request", msg.clone()),
            Self::Agent(err) => (err.kind(), err.user_message()),
        };
        json!({ "error": { "kind": kind, "message": message } })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = ?self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = ?self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub provider: String,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub provider: String,
    pub model: String,
    pub tools: Vec<String>,
    pub delegates: Vec<String>,
    pub default: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub agent: String,
    pub text: String,
    pub turns: usize,
    pub message_id: MessageId,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: Vec<MessageId>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let checks = state.providers.iter().map(|(name, provider)| async move {
        (name.clone(), provider.health_check().await.unwrap_or(false))
    });
    let providers = futures::future::join_all(checks).await.into_iter().collect();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        providers,
    })
}

/// Models offered by every configured provider
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    let mut names: Vec<&String> = state.providers.keys().collect();
    names.sort();

    let mut entries = Vec::new();
    for name in names {
        let Some(provider) = state.providers.get(name) else {
            continue;
        };
        match provider.list_models().await {
            Ok(models) => entries.extend(models.into_iter().map(|m| ModelEntry {
                provider: name.clone(),
                id: m.id,
                name: m.name,
            })),
            Err(e) => tracing::warn!(provider = %name, error = %e, "could not list models"),
        }
    }
    Json(entries)
}

/// Agents in the roster
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    let default_agent = state.chat.default_agent();
    let agents = state
        .chat
        .orchestrator()
        .roster()
        .agents()
        .map(|agent| AgentSummary {
            name: agent.name().to_string(),
            description: agent.description().to_string(),
            provider: agent.provider().name().to_string(),
            model: agent.model().to_string(),
            tools: agent.tools().names().into_iter().map(str::to_string).collect(),
            delegates: agent.delegates().to_vec(),
            default: agent.name() == default_agent,
        })
        .collect();
    Json(agents)
}

/// Start a session; the body is optional
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let request: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let info = state.chat.create_session(request.agent.as_deref())?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.chat.sessions())
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDetail>> {
    let id = SessionId::from_string(id);
    Ok(Json(SessionDetail {
        info: state.chat.session(&id)?,
        messages: state.chat.messages(&id)?,
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.chat.remove_session(&SessionId::from_string(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Submit user text and wait for the turn to finish
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<Json<TurnResponse>> {
    let id = SessionId::from_string(id);
    let outcome = state.chat.submit(&id, payload.text)?.outcome().await?;

    Ok(Json(TurnResponse {
        agent: outcome.agent,
        text: outcome.text,
        turns: outcome.turns,
        message_id: outcome.message_id,
    }))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state
        .chat
        .delete_message(&SessionId::from_string(id), &MessageId::from_string(message_id))?;
    Ok(Json(DeletedResponse { deleted }))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.chat.cancel(&SessionId::from_string(id))?;
    Ok(Json(CancelResponse { cancelled }))
}

/// WebSocket of conversation events; text frames `{"text": ...}` submit turns
pub async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = SessionId::from_string(id);
    let events = state.chat.subscribe(&id)?;
    Ok(ws.on_upgrade(move |socket| handle_stream(socket, state, id, events)))
}

fn error_frame(kind: &str, message: &str) -> WsMessage {
    let frame = json!({ "type": "error", "error": { "kind": kind, "message": message } });
    WsMessage::Text(frame.to_string().into())
}

async fn handle_stream(
    socket: WebSocket,
    state: AppState,
    id: SessionId,
    mut events: broadcast::Receiver<ConversationEvent>,
) {
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(session = %id, "stream opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(session = %id, error = %e, "could not encode event");
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %id, skipped, "stream client lagging");
                    let notice = json!({ "type": "lagged", "skipped": skipped });
                    if sender.send(WsMessage::Text(notice.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match serde_json::from_str::<SubmitRequest>(text.as_str()) {
                        Ok(request) => state
                            .chat
                            .submit(&id, request.text)
                            .err()
                            .map(|e| error_frame(e.kind(), &e.user_message())),
                        Err(e) => Some(error_frame("bad_request", &e.to_string())),
                    };
                    if let Some(reply) = reply {
                        if sender.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!(session = %id, error = %e, "websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(session = %id, "stream closed");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use agent_core::{
        provider::ModelInfo, Agent, AgentRoster, ChatService, GenerationOptions, LlmProvider,
        Orchestrator, OrchestratorConfig, ProviderResult, Role, SubmitPolicy, ToolSchema,
    };
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn health_check(&self) -> agent_core::Result<bool> {
            Ok(true)
        }

        async fn send(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> agent_core::Result<ProviderResult> {
            let last = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(Message::content)
                .unwrap_or_default();
            Ok(ProviderResult::FinalMessage(format!("echo: {last}")))
        }

        async fn list_models(&self) -> agent_core::Result<Vec<ModelInfo>> {
            Ok(vec![ModelInfo {
                id: "echo-1".into(),
                name: "Echo".into(),
                context_length: None,
                supports_vision: false,
            }])
        }
    }

    fn app() -> axum::Router {
        let provider: Arc<dyn LlmProvider> = Arc::new(EchoProvider);
        let agent = Agent::builder("assistant")
            .description("Echoes the user")
            .provider(Arc::clone(&provider))
            .model("echo-1")
            .build()
            .unwrap();
        let roster = AgentRoster::new().with(agent).unwrap();
        let orchestrator = Orchestrator::new(roster, OrchestratorConfig::default()).unwrap();
        let chat = ChatService::new(orchestrator, "assistant", SubmitPolicy::default()).unwrap();

        let mut providers = HashMap::new();
        providers.insert("echo".to_string(), provider);
        crate::router(AppState::new(chat, providers))
    }

    async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_reports_providers() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providers"]["echo"], true);
    }

    #[tokio::test]
    async fn test_models_and_agents() {
        let app = app();
        let (_, models) = call(&app, "GET", "/api/models", None).await;
        assert_eq!(models[0]["provider"], "echo");
        assert_eq!(models[0]["id"], "echo-1");

        let (_, agents) = call(&app, "GET", "/api/agents", None).await;
        assert_eq!(agents[0]["name"], "assistant");
        assert_eq!(agents[0]["provider"], "echo");
        assert_eq!(agents[0]["default"], true);
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let app = app();
        let (status, session) = call(&app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = session["id"].as_str().unwrap().to_string();

        let (status, turn) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/messages"),
            Some(json!({ "text": "hello there" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["text"], "echo: hello there");
        assert_eq!(turn["turns"], 0);

        let (_, detail) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(detail["title"], "hello there");
        assert_eq!(detail["messages"].as_array().unwrap().len(), 2);
        assert_eq!(detail["messages"][1]["role"], "assistant");

        let (_, listed) = call(&app, "GET", "/api/sessions", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_message() {
        let app = app();
        let (_, session) = call(&app, "POST", "/api/sessions", Some(json!({}))).await;
        let id = session["id"].as_str().unwrap().to_string();
        let (_, turn) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/messages"),
            Some(json!({ "text": "hi" })),
        )
        .await;
        let message_id = turn["message_id"].as_str().unwrap();

        let (status, deleted) = call(
            &app,
            "DELETE",
            &format!("/api/sessions/{id}/messages/{message_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"][0], message_id);

        let (_, detail) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(detail["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_bodies() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/sessions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        let (status, body) =
            call(&app, "POST", "/api/sessions", Some(json!({ "agent": "nobody" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        let (_, session) = call(&app, "POST", "/api/sessions", None).await;
        let id = session["id"].as_str().unwrap();
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/messages"),
            Some(json!({ "text": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "conversation_error");

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 0);
    }
}
