//! Chain indexer - materializes the ledger's event log into replayable
//! projections and decouples downstream readers from direct chain queries.
//!
//! Ingestion is exactly-once by construction: events are keyed by
//! (tx_hash, log_index) and inserted if absent, so re-processing any range
//! is a no-op, and the cursor only advances after a range is fully
//! written. A crash mid-range resumes at the old cursor.

pub mod projection;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::AppResult;
use crate::ledger::{EventSchema, LedgerClient, RawLog};
use crate::store::models::{EventKind, LedgerEvent};
use crate::store::{SettlementStore, CURSOR_INDEXER};

/// Indexer tunables
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub poll_interval: Duration,
    /// Maximum blocks per index_range call - bounds memory and request size
    pub chunk_size: i64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            chunk_size: 512,
        }
    }
}

/// Why a single log entry could not be decoded. Never fatal to a range.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("topic {0} not in the declared schema")]
    UnknownTopic(String),

    #[error("event name {0} not recognized")]
    UnknownEventName(String),

    #[error("missing or malformed field '{0}'")]
    BadField(&'static str),
}

/// Decode one raw log entry against the ledger's declared schema.
pub fn decode_log(schema: &EventSchema, log: &RawLog) -> Result<LedgerEvent, DecodeError> {
    let descriptor = schema
        .descriptor(&log.topic)
        .ok_or_else(|| DecodeError::UnknownTopic(log.topic.clone()))?;

    let kind = EventKind::from_declared_name(&descriptor.name)
        .ok_or_else(|| DecodeError::UnknownEventName(descriptor.name.clone()))?;

    let amount = log
        .data
        .get("amount")
        .and_then(|v| v.as_u64())
        .ok_or(DecodeError::BadField("amount"))?;

    let account = if descriptor.has_account {
        Some(
            log.data
                .get("account")
                .and_then(|v| v.as_str())
                .ok_or(DecodeError::BadField("account"))?
                .to_string(),
        )
    } else {
        None
    };

    let ref_id = if descriptor.has_ref {
        Some(
            log.data
                .get("ref_id")
                .and_then(|v| v.as_str())
                .ok_or(DecodeError::BadField("ref_id"))?
                .to_string(),
        )
    } else {
        None
    };

    Ok(LedgerEvent {
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index,
        block_number: log.block_number,
        kind,
        account,
        amount,
        ref_id,
        timestamp: log.timestamp,
    })
}

/// Outcome of one index_range call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct ChainIndexer {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerClient>,
    schema: EventSchema,
    config: IndexerConfig,
}

impl ChainIndexer {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerClient>,
        schema: EventSchema,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            schema,
            config,
        }
    }

    /// Ingest ledger log entries in the block range `(from, to]` and
    /// refresh projections for every account touched. Idempotent: running
    /// the same range any number of times yields the same stored state.
    pub async fn index_range(&self, from: i64, to: i64) -> AppResult<IndexSummary> {
        let logs = self.ledger.fetch_logs(from, to).await?;

        let mut summary = IndexSummary::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for log in &logs {
            let event = match decode_log(&self.schema, log) {
                Ok(event) => event,
                Err(e) => {
                    // A malformed or unrecognized entry must not halt the
                    // projection - skip it and keep going.
                    warn!(
                        tx = %log.tx_hash,
                        log_index = log.log_index,
                        "skipping undecodable log entry: {}",
                        e
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            if self.store.insert_event(&event).await? {
                summary.inserted += 1;
            } else {
                summary.duplicates += 1;
            }
            if let Some(account) = &event.account {
                touched.insert(account.clone());
            }
        }

        for account in &touched {
            let events = self.store.events_for_account(account).await?;
            let projection = projection::project_account(account, &events);
            self.store.upsert_projection(&projection).await?;
        }

        let all_events = self.store.all_events().await?;
        if let Some(point) = projection::pool_point(&all_events) {
            self.store.upsert_pool_point(&point).await?;
        }

        // Cursor moves only after everything above is durable; resuming at
        // the old cursor re-processes the range, which is a no-op.
        self.store.set_cursor(CURSOR_INDEXER, to).await?;

        if summary.inserted > 0 || summary.skipped > 0 {
            info!(
                from,
                to,
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                skipped = summary.skipped,
                "indexed block range"
            );
        }

        Ok(summary)
    }

    /// Follow the chain head in bounded chunks. A chain that has not
    /// advanced is a no-op cycle; RPC errors skip the cycle.
    pub async fn catch_up(&self) -> AppResult<()> {
        let head = match self.ledger.head_block().await {
            Ok(head) => head,
            Err(e) => {
                warn!("chain head unavailable, skipping cycle: {}", e);
                return Ok(());
            }
        };

        let mut cursor = self.store.get_cursor(CURSOR_INDEXER).await?.unwrap_or(0);
        if cursor >= head {
            debug!(cursor, head, "chain has not advanced");
            return Ok(());
        }

        while cursor < head {
            let to = (cursor + self.config.chunk_size).min(head);
            self.index_range(cursor, to).await?;
            cursor = to;
        }

        Ok(())
    }

    /// Periodic loop; cycles never overlap and the loop exits on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "🔄 Chain indexer loop started (every {:?}, chunks of {})",
            self.config.poll_interval, self.config.chunk_size
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.catch_up().await {
                        error!("indexer cycle failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Chain indexer loop stopping");
                    break;
                }
            }
        }
    }
}
