//! Wealth Steward
//!
//! A conversational financial-advisory agent served over an
//! OpenAI-compatible streaming API:
//! - Routes each message to small talk or the advisory path
//! - Gates advice on a minimum user profile, learned across turns
//! - Runs a bounded think/act loop over market-data and calculator tools
//! - Separates reasoning from answer text while streaming
//! - Checkpoints every conversation so interrupted turns resume
//!
//! TURN:
//! ROUTE → { SMALL TALK | GATE → { CLARIFY | THINK ⇄ ACT } } → PERSIST

pub mod agent;
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod profile;
pub mod prompts;
pub mod router;
pub mod stream;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::{Orchestrator, TurnEvent, TurnRequest, TurnStatus};
pub use config::{AgentConfig, Settings};
pub use models::*;

use checkpoint::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
use llm::GeminiClient;
use std::sync::Arc;
use tools::{create_default_registry, market::YahooFinanceClient, ToolDispatcher};
use tracing::{info, warn};

/// Wire the production components described by `settings`.
pub fn build_orchestrator(settings: &Settings) -> Result<Arc<Orchestrator>> {
    if settings.gemini_api_key.trim().is_empty() {
        warn!("GEMINI_API_KEY not set; model calls will fail");
    }

    let reasoning = GeminiClient::new(settings.gemini_api_key.clone(), settings.gemini_model.clone())?;
    let light = GeminiClient::new(settings.gemini_api_key.clone(), settings.router_model.clone())?;

    let registry = create_default_registry(YahooFinanceClient::new()?, Some(light.clone()));
    info!(tools = ?registry.list(), "Tools registered");
    let dispatcher = ToolDispatcher::new(Arc::new(registry), settings.agent.tool_timeout);

    let store: Arc<dyn CheckpointStore> = match &settings.database_url {
        Some(url) => Arc::new(PostgresCheckpointStore::connect_lazy(url)?),
        None => {
            info!("Checkpoint backend: in-memory (DATABASE_URL not set)");
            Arc::new(InMemoryCheckpointStore::new())
        }
    };

    Ok(Arc::new(Orchestrator::new(
        Arc::new(reasoning),
        Arc::new(light),
        dispatcher,
        store,
        settings.agent.clone(),
    )))
}
