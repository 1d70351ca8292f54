//! Courier webhook delivery service.
//!
//! Main entry point. Loads configuration, selects storage, starts the
//! delivery engine and serves the management API until SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{create_router, shutdown_signal, start_server, AppState, Config};
use courier_core::{
    storage::{InMemoryStore, PostgresStore},
    Clock, DeliveryStore, EventHandler, MulticastEventHandler, RealClock, TracingEventHandler,
    WebhookRegistry, WebhookStore,
};
use courier_delivery::DeliveryEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting courier webhook delivery service");

    let config = Config::load()?;
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("in-memory"),
        host = %config.host,
        port = config.port,
        workers = config.worker_pool_size,
        "Configuration loaded"
    );
    if config.allow_insecure_urls {
        warn!("ALLOW_INSECURE_URLS is set; http:// webhooks will be accepted");
    }

    let (webhook_store, delivery_store, pool) = open_storage(&config).await?;

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let registry = WebhookRegistry::new(webhook_store, clock.clone(), config.to_registry_config());

    let mut outcomes = MulticastEventHandler::new();
    outcomes.add_subscriber(Arc::new(TracingEventHandler));
    let outcomes: Arc<dyn EventHandler> = Arc::new(outcomes);

    let mut engine = DeliveryEngine::with_event_handler(
        registry.clone(),
        delivery_store.clone(),
        config.to_delivery_config(),
        clock.clone(),
        outcomes,
    )
    .context("Failed to build delivery engine")?;

    let recovered = engine.recover_pending().await.context("Failed to recover pending attempts")?;
    engine.start().await.context("Failed to start delivery workers")?;
    info!(recovered, "Delivery engine running");

    let state = AppState::from_engine(&engine, registry, delivery_store, clock);
    let app = create_router(state, config.request_timeout());
    let addr = config.parse_server_addr()?;

    start_server(app, addr, shutdown_signal()).await.context("HTTP server failed")?;

    info!("Stopping delivery engine");
    engine.shutdown().await.context("Delivery engine did not stop cleanly")?;

    if let Some(pool) = pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

type Storage = (Arc<dyn WebhookStore>, Arc<dyn DeliveryStore>, Option<sqlx::PgPool>);

/// PostgreSQL when `DATABASE_URL` is set, otherwise process memory.
async fn open_storage(config: &Config) -> Result<Storage> {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; using in-memory storage, nothing survives a restart");
        let store = InMemoryStore::new();
        return Ok((Arc::new(store.clone()), Arc::new(store), None));
    };

    let pool = create_database_pool(config, url).await?;
    info!("Database connection pool established");

    let store = PostgresStore::new(pool.clone());
    store.migrate().await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    Ok((Arc::new(store.clone()), Arc::new(store), Some(pool)))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config, url: &str) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
