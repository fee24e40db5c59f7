use std::sync::Arc;

use tokio::net::TcpListener;

use approvals_backend::config::Config;
use approvals_backend::directory::UserDirectory;
use approvals_backend::{logging, routes, AppState};

const USAGE: &str = "Usage: approvals-api [--migrate-only] [--version]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut migrate_only = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("approvals-api {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--migrate-only" => migrate_only = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => return Err(format!("Unknown argument: {other}\n{USAGE}").into()),
        }
    }

    // Load configuration
    let config = Config::load()?;

    logging::init(&config.logging.level);

    let directory = UserDirectory::open(&config.database)?;

    if migrate_only {
        let report = directory.migrate()?;
        tracing::info!(
            "Migrations complete: {} applied, {} already present",
            report.applied.len(),
            report.skipped.len()
        );
        return Ok(());
    }

    tracing::info!("Starting approvals API v{}", env!("CARGO_PKG_VERSION"));

    for warning in config.warnings() {
        tracing::warn!("Configuration: {}", warning);
    }

    if config.database.run_migrations {
        directory.migrate()?;
    }

    let state = Arc::new(AppState::new(config.clone(), directory)?);

    tracing::info!(
        "Token verification: jwks_uri={} issuers={:?}",
        state.jwks_client.jwks_uri(),
        state.jwks_client.issuers()
    );
    match state.jwks_client.refresh_keys().await {
        Ok(count) => tracing::info!("Signing key cache warmed with {} keys", count),
        Err(e) => tracing::warn!("Could not prefetch signing keys, will retry on demand: {}", e),
    }

    let app = routes::router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
