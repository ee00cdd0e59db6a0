mod config;
mod curriculum;
mod llm_client;
mod prompt;
mod server;
mod store;
mod topic;
mod worksheet;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use config::TutorConfig;
use curriculum::Curriculum;
use llm_client::LlmClient;
use server::ServerState;
use store::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,studybuddy_backend=debug")),
        )
        .init();

    tracing::info!("StudyBuddy backend starting...");

    let config = TutorConfig::load();
    let curriculum = Curriculum::load(config.curriculum_path.as_deref())?;
    tracing::info!(
        "Year {} curriculum v{} loaded: {} topics",
        config.default_year_level,
        curriculum.meta.version,
        curriculum.topic_catalog.len()
    );

    let llm = if config.llm_api_url.trim().is_empty() {
        tracing::warn!("llm_api_url is empty; running with canned Socratic fallbacks only");
        None
    } else {
        tracing::info!("LLM: {} at {}", config.llm_model, config.llm_api_url);
        Some(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone().unwrap_or_default(),
            config.llm_model.clone(),
            config.max_response_tokens,
        ))
    };

    let state = Arc::new(ServerState {
        store: SessionStore::new(&config),
        curriculum,
        llm,
        config,
    });

    server::serve(state).await
}
