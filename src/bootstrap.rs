use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::AppState;
use crate::bridge::{BridgeConfig, SettlementBridge};
use crate::broker::{BrokerFeed, HttpBrokerFeed};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::indexer::{ChainIndexer, IndexerConfig};
use crate::ledger::{HttpLedgerClient, LedgerClient};
use crate::recon::{ReconConfig, ReconEngine};
use crate::store::{MemoryStore, PgStore, SettlementStore};

pub async fn initialize_app_state(
    config: &Config,
) -> AppResult<(AppState, Arc<watch::Sender<bool>>, Vec<JoinHandle<()>>)> {
    info!("Initializing application components ...");

    // Persistent store - the sole shared-mutation point between the loops
    let store: Arc<dyn SettlementStore> = if config.store_backend == "memory" {
        warn!("⚠️  In-memory store selected - dedup state will NOT survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let pool = initialize_database(&config.database_url).await?;
        Arc::new(PgStore::new(pool))
    };

    let ledger: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(&config.ledger_url));
    let feed: Arc<dyn BrokerFeed> = Arc::new(HttpBrokerFeed::new(&config.broker_url));

    // The ledger's declared event interface drives all log decoding
    let schema = ledger.load_schema().await?;
    info!("✅ Ledger event schema loaded ({} event kinds)", schema.len());

    let paused = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge = Arc::new(SettlementBridge::new(
        store.clone(),
        ledger.clone(),
        feed.clone(),
        BridgeConfig {
            poll_interval: Duration::from_secs(config.bridge_poll_secs),
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(config.retry_base_secs),
            retry_cap: Duration::from_secs(config.retry_cap_secs),
            asset_scale: config.asset_scale,
        },
        paused.clone(),
    ));

    let indexer = Arc::new(ChainIndexer::new(
        store.clone(),
        ledger.clone(),
        schema,
        IndexerConfig {
            poll_interval: Duration::from_secs(config.indexer_poll_secs),
            chunk_size: config.index_chunk_size,
        },
    ));

    let recon = Arc::new(ReconEngine::new(
        store.clone(),
        ReconConfig {
            poll_interval: Duration::from_secs(config.recon_poll_secs),
            break_threshold: chrono::Duration::seconds(config.break_threshold_secs),
            max_retries: config.max_retries,
        },
    ));

    let mut handles = Vec::new();
    handles.push(tokio::spawn(bridge.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(indexer.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(recon.run(shutdown_rx)));
    info!("✅ Background loops started (bridge, indexer, reconciliation)");

    let state = AppState { store, paused };
    Ok((state, Arc::new(shutdown_tx), handles))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Internal(format!("migration failed: {}", e)))?;

    info!("✓ Database initialized");
    Ok(pool)
}
