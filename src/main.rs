//! ODL circulation server
//!
//! Serves the distributor notification callback and runs hold reconciliation.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use odl_circulation::{
    api,
    config::AppConfig,
    repository::PgLedgerStore,
    services::{
        reconcile::spawn_reconcile_task, CirculationService, EmailNotifier, HoldNotifier,
        HttpStatusDocumentClient, NoopNotifier,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("odl_circulation={},tower_http=debug", config.logging.level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting ODL circulation v{}", env!("CARGO_PKG_VERSION"));

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations completed");

    let notifier: Arc<dyn HoldNotifier> = if config.email.enabled {
        Arc::new(EmailNotifier::new(config.email.clone()))
    } else {
        Arc::new(NoopNotifier)
    };
    let distributor = HttpStatusDocumentClient::new(&config.distributor)
        .context("Failed to create distributor client")?;
    let circulation = CirculationService::new(
        Arc::new(PgLedgerStore::new(pool)),
        Arc::new(distributor),
        config.distributor.clone(),
        &config.circulation,
    )
    .with_notifier(notifier);

    spawn_reconcile_task(
        circulation.clone(),
        Duration::from_secs(config.circulation.reconcile_interval_seconds),
    );

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .context("Invalid host address")?,
        config.server.port,
    );

    let state = AppState {
        config: Arc::new(config),
        circulation,
    };
    let app = api::router(state);

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
