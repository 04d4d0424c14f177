//! berth provisioner
//!
//! Serves the provisioning HTTP API: admission control, placement and
//! server creation for game-server plans.

use std::sync::Arc;

use anyhow::Result;
use berth_provisioner::{
    api,
    config::{Config, StoreBackend},
    creation::HttpCreationService,
    db::Database,
    state::AppState,
    store::{MemoryStore, Stores},
    Orchestrator,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to BERTH_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting berth provisioner");
    info!(listen_addr = %config.listen_addr, store = ?config.store, "Configuration loaded");

    let stores = match config.store {
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            Stores::shared(Arc::new(db.store()))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is lost on restart");
            Stores::shared(Arc::new(MemoryStore::new()))
        }
    };

    let creation = HttpCreationService::new(
        config.creation_url.clone(),
        config.creation_token.clone(),
        config.engine.creation_timeout,
    )?;
    info!(creation_url = %config.creation_url, "Creation service configured");

    let orchestrator = Orchestrator::new(stores, Arc::new(creation), config.engine.clone());
    let app = api::create_router(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!("Provisioner shutdown complete");
    Ok(())
}
