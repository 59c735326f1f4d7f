//! agentmcp HTTP server binary.
//!
//! Starts an axum HTTP server exposing the capability registry actions.
//!
//! # Environment Variables
//!
//! - `AGENTMCP_PORT`: HTTP port (default: 8080)
//! - `AGENTMCP_STORE`: Storage backend: "sqlite" (default) or "memory"
//! - `AGENTMCP_DB_PATH`: SQLite file (default: `<data dir>/agentmcp.db`)
//! - `EMBEDDING_URL`: Embedding service; unset disables semantic matching
//! - `ANTHROPIC_API_KEY`: Enables on-demand agent generation
//! - `RUST_LOG`: Tracing filter (default: "info,agentmcp=debug")
//!
//! # Usage
//!
//! ```bash
//! AGENTMCP_STORE=memory cargo run --bin server
//! ```

use std::sync::Arc;

use agentmcp::actions::ActionRouter;
use agentmcp::config::{Settings, StoreBackend};
use agentmcp::dispatch::CapabilityDispatcher;
use agentmcp::embeddings::HttpEmbeddingProvider;
use agentmcp::generator::AnthropicGenerator;
use agentmcp::governance::GovernanceEngine;
use agentmcp::server::{app_router, AppState};
use agentmcp::store::{CapabilityStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agentmcp=debug".into()),
        )
        .init();

    let settings = Settings::from_env().expect("Invalid configuration");
    let bind_addr = format!("0.0.0.0:{}", settings.port);

    let store: Arc<dyn CapabilityStore> = match &settings.store {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; registrations are lost on exit");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite(path) => {
            tracing::info!("Opening SQLite store at {}", path.display());
            Arc::new(SqliteStore::new(path.clone()).expect("Failed to open database"))
        }
    };

    let mut dispatcher = CapabilityDispatcher::new(store.clone(), settings.dispatch.clone());

    match &settings.embedding_url {
        Some(url) => match HttpEmbeddingProvider::new(url, settings.embedding_timeout) {
            Ok(provider) => {
                tracing::info!("Semantic matching enabled via {}", url);
                dispatcher = dispatcher.with_embedder(Arc::new(provider));
            }
            Err(e) => tracing::error!("Embedding provider disabled: {}", e),
        },
        None => tracing::warn!("EMBEDDING_URL not set; semantic matching disabled"),
    }

    match &settings.anthropic_api_key {
        Some(key) => match AnthropicGenerator::new(
            key,
            &settings.generator_model,
            settings.generator_timeout,
        ) {
            Ok(generator) => {
                tracing::info!("Agent generation enabled ({})", settings.generator_model);
                dispatcher = dispatcher.with_generator(Arc::new(generator));
            }
            Err(e) => tracing::error!("Agent generation disabled: {}", e),
        },
        None => tracing::warn!("ANTHROPIC_API_KEY not set; agent generation disabled"),
    }

    let governance = GovernanceEngine::new(store.clone(), settings.governance.clone());
    if !settings.governance.enabled {
        tracing::warn!("Governance disabled; all governance actions will be refused");
    }

    let router = ActionRouter::new(store, dispatcher, governance, settings.limits.clone());
    let app = app_router(AppState::new(router));

    tracing::info!("agentmcp server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health       : liveness probe");
    tracing::info!("  GET  /actions      : action catalog");
    tracing::info!("  POST /actions/:name: invoke an action");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .await
        .expect("Server failed");
}
