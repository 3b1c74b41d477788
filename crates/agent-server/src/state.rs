//! Application State

use std::collections::HashMap;
use std::sync::Arc;

use agent_core::{ChatService, LlmProvider};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Sessions, agents and the orchestration loop
    pub chat: Arc<ChatService>,

    /// Configured providers by name, for health and model listing
    pub providers: Arc<HashMap<String, Arc<dyn LlmProvider>>>,
}

impl AppState {
    pub fn new(chat: ChatService, providers: HashMap<String, Arc<dyn LlmProvider>>) -> Self {
        Self {
            chat: Arc::new(chat),
            providers: Arc::new(providers),
        }
    }
}
