use anyhow::Result;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

mod config;
mod error;
mod logging;
mod models;
mod routes;
mod services;

use services::completion::{CompletionSource, LlmClient};
use services::session::SessionStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    logging::init_logging()?;

    // Load configuration
    let config = config::load_config()?;

    // Build our application state
    let state = Arc::new(AppState::new(config));
    let bind_addr = state.config.bind_addr;

    let app = routes::routes(state.config.max_file_size)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// Application state
pub struct AppState {
    pub config: config::Config,
    pub sessions: SessionStore,
    pub llm: Arc<dyn CompletionSource>,
}

impl AppState {
    fn new(config: config::Config) -> Self {
        let llm = Arc::new(LlmClient::new(&config));
        let sessions = SessionStore::new(config.session_ttl);
        Self {
            config,
            sessions,
            llm,
        }
    }
}
