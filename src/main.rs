//! tankobon chapter delivery service.
//!
//! Loads configuration, picks a storage backend, assembles the delivery
//! engine, the discovery loop and the command surface, and coordinates
//! graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tankobon_api::{
    gateway::http_client, AppState, CommandDispatcher, Config, GatewayConverter, GatewayProducer,
    GatewayProvider,
};
use tankobon_core::{
    storage::{MemoryStore, PgStore, Store},
    Clock, JobSink, OutputFormat, RealClock,
};
use tankobon_delivery::{
    ArtifactCache, ConverterSet, DeliveryEngine, DeliveryPipeline, HttpChannel,
};
use tankobon_discovery::{DiscoveryLoop, ProviderRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(version = env!("CARGO_PKG_VERSION"), "starting tankobon");
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("<memory>"),
        workers = config.worker_pool_size,
        providers = config.providers.len(),
        discovery_interval_secs = config.discovery_interval_secs,
        "configuration loaded"
    );

    match &config.database_url {
        Some(url) => {
            let pool = create_database_pool(&config, url).await?;
            let database = PgStore::new(pool);
            database.migrate().await.context("failed to run database migrations")?;
            info!("database migrations completed");

            let result = run(&config, Arc::new(database.clone()), Some(database.clone())).await;
            database.pool().close().await;
            info!("database connections closed");
            result
        },
        None => {
            warn!("no DATABASE_URL configured, state will not survive a restart");
            run(&config, Arc::new(MemoryStore::new()), None).await
        },
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(fallback: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info,tankobon=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
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
            .idle_timeout(Duration::from_secs(600))
            .connect(url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                info!("database connection pool established");
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Builds the provider registry from configuration, with paused providers
/// already marked.
fn build_registry(config: &Config, client: &reqwest::Client) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        registry.register(Arc::new(GatewayProvider::new(provider, client.clone())));
    }
    for id in &config.paused_providers {
        if !registry.pause(id) {
            warn!(provider = %id, "paused provider is not configured");
        }
    }
    info!(providers = ?registry.by_language(), "source providers registered");
    registry
}

async fn run<S: Store>(config: &Config, store: Arc<S>, database: Option<PgStore>) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let client = http_client(Duration::from_secs(config.gateway_timeout_secs))
        .context("failed to build gateway HTTP client")?;

    let registry = Arc::new(build_registry(config, &client));
    let cache = ArtifactCache::new(store.clone());

    let converters = OutputFormat::ALL.into_iter().fold(ConverterSet::new(), |set, format| {
        set.with(Arc::new(GatewayConverter::new(format, &config.gateway_url, client.clone())))
    });
    let channel = HttpChannel::new(config.to_client_config())
        .context("failed to build outbound channel")?;
    let pipeline = DeliveryPipeline::new(
        cache.clone(),
        store.clone(),
        Arc::new(GatewayProducer::new(&config.gateway_url, client.clone())),
        converters,
        Arc::new(channel),
        config.to_retry_policy(),
        clock.clone(),
    );

    let mut engine = DeliveryEngine::new(config.to_delivery_config(), pipeline);
    engine.start().await.context("failed to start delivery engine")?;
    let handle = engine.handle();

    let cancel = CancellationToken::new();

    let discovery = DiscoveryLoop::new(
        registry.clone(),
        store.clone(),
        store.clone(),
        Arc::new(handle.clone()) as Arc<dyn JobSink>,
        clock.clone(),
        config.to_discovery_config(),
    );
    let discovery_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { discovery.run(cancel).await }
    });

    let dispatcher = Arc::new(CommandDispatcher::new(
        registry,
        store.clone(),
        store.clone(),
        cache,
        handle.clone(),
        config.token_capacity,
        config.token_ttl(),
        clock.clone(),
    ));
    let purge_task = tokio::spawn(purge_tokens(dispatcher.clone(), config.token_ttl(), cancel.clone()));

    let state = AppState { dispatcher, engine: handle, database, clock };
    let addr = config.parse_server_addr()?;
    let server = tankobon_api::start_server(
        state,
        addr,
        Duration::from_secs(config.request_timeout),
        cancel.clone(),
    );

    info!(%addr, "tankobon is ready");
    if let Err(e) = server.await {
        error!(error = %e, "command surface failed");
    }

    info!("shutdown requested, stopping discovery");
    cancel.cancel();
    if let Err(e) = discovery_task.await {
        error!(error = %e, "discovery task panicked");
    }
    if let Err(e) = purge_task.await {
        error!(error = %e, "token purge task panicked");
    }

    info!("draining delivery engine");
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not stop cleanly");
    }

    info!("tankobon shutdown complete");
    Ok(())
}

/// Drops expired selection tokens once per `ttl` until cancelled.
async fn purge_tokens(dispatcher: Arc<CommandDispatcher>, ttl: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ttl);
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = dispatcher.purge_tokens();
                if removed > 0 {
                    info!(removed, remaining = dispatcher.token_count(), "expired tokens purged");
                }
            },
        }
    }
}
