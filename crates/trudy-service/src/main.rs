//! Trudy Service - HTTP API for the Trudy voice-AI backend
//!
//! This is the main entry point for the trudy service.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trudy_service::{create_router, AppState, ServiceConfig};
use trudy_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trudy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Trudy Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        database_configured = config.database_url.is_some(),
        ultravox_base_url = %config.ultravox_base_url,
        ultravox_configured = !config.ultravox_api_key.is_empty(),
        stripe_configured = config.stripe_webhook_secret.is_some(),
        egress_mode = ?config.egress_mode,
        rate_limit_enabled = config.rate_limit_enabled,
        api_key_encryption = config.api_key_encryption_key.is_some(),
        "Service configuration loaded"
    );

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL");
            Arc::new(PgStore::connect(url, config.database_max_connections).await?)
        }
        None => {
            tracing::warn!("DATABASE_URL not set - using in-memory store, data will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    // Build app state
    let state = AppState::new(store, config.clone())?;

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
