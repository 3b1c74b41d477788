//! agent-orchestra HTTP Server
//!
//! Axum-based server exposing the message service: sessions, turns,
//! message deletion and a WebSocket of conversation events.

mod handlers;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    builtin::{CalculatorTool, DateTimeTool},
    retry::{RetryPolicy, RetryProvider},
    ChatService, LlmProvider, Orchestrator, OrchestratorConfig, RosterConfig, ToolRegistry,
};
use agent_runtime::{OllamaProvider, OpenAiProvider, WebSearchTool};

use crate::handlers::{
    cancel_session, create_session, delete_message, delete_session, get_session, health_check,
    list_agents, list_models, list_sessions, post_message, session_stream,
};
use crate::state::AppState;

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/agents", get(list_agents))
        // Sessions
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/messages", post(post_message))
        .route("/api/sessions/{id}/messages/{message_id}", delete(delete_message))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}/stream", get(session_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Providers available to agents, each wrapped with retry/backoff
fn build_providers() -> HashMap<String, Arc<dyn LlmProvider>> {
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert(
        "ollama".into(),
        Arc::new(RetryProvider::new(OllamaProvider::from_env(), RetryPolicy::default())),
    );
    if std::env::var_os("OPENAI_API_KEY").is_some() || std::env::var_os("OPENAI_BASE_URL").is_some() {
        providers.insert(
            "openai".into(),
            Arc::new(RetryProvider::new(OpenAiProvider::from_env(), RetryPolicy::default())),
        );
    }
    providers
}

/// Tools agents may list in their configuration
fn build_catalog() -> anyhow::Result<ToolRegistry> {
    let mut catalog = ToolRegistry::new();
    catalog.register(DateTimeTool)?;
    catalog.register(CalculatorTool)?;
    catalog.register(WebSearchTool::new())?;
    Ok(catalog)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let providers = build_providers();
    for (name, provider) in &providers {
        match provider.health_check().await {
            Ok(true) => tracing::info!(provider = %name, "provider reachable"),
            Ok(false) | Err(_) => tracing::warn!(provider = %name, "provider not reachable; turns using it will fail"),
        }
    }

    let catalog = build_catalog()?;
    tracing::info!(tools = ?catalog.names(), "tool catalog ready");

    let config_path = std::env::var("AGENTS_CONFIG").unwrap_or_else(|_| "agents.toml".into());
    let roster_config = RosterConfig::load(&config_path)
        .with_context(|| format!("loading agent configuration from {config_path}"))?;
    let roster = roster_config.build_roster(&providers, &catalog)?;
    let default_agent = roster_config
        .default_agent()
        .context("agent configuration defines no agents")?
        .to_string();

    let orchestrator_config = roster_config
        .orchestrator(OrchestratorConfig::default())
        .with_env_overrides();
    tracing::info!(
        agents = ?roster.names(),
        default_agent = %default_agent,
        max_turns = orchestrator_config.max_turns,
        max_delegation_depth = orchestrator_config.max_delegation_depth,
        policy = ?roster_config.submit_policy,
        "agent roster loaded"
    );

    let orchestrator = Orchestrator::new(roster, orchestrator_config)?;
    let chat = ChatService::new(orchestrator, default_agent, roster_config.submit_policy)?;
    let app = router(AppState::new(chat, providers));

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("agent-orchestra listening on http://{addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
