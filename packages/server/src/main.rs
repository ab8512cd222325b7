// Main entry point for the scraper server

use anyhow::{Context, Result};
use enricher::browser::ChromiumDriver;
use enricher::extract::HrefContactExtractor;
use enricher::Config;
use server_core::Orchestrator;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,enricher=debug,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting contact enrichment server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(server = %config.server_name, "Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Cooperative shutdown: first Ctrl-C finishes the current batch,
    // second exits immediately.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current batch before exit");
            let _ = shutdown_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });

    let driver = ChromiumDriver::new(config.browser.clone());
    let orchestrator = Orchestrator::new(config, pool, driver, HrefContactExtractor, shutdown_rx);

    let summary = orchestrator.run().await.context("Scrape run failed")?;
    tracing::info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Server exiting"
    );

    Ok(())
}
