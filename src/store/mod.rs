//! Persistent store - the single shared-mutation point between the bridge,
//! indexer and reconciliation loops.
//!
//! Everything correctness-bearing lives here: delivery states (dedup),
//! ledger events, projections, reconciliation results and loop cursors.
//! Nothing is kept in-memory-only, so a restart never loses deduplication
//! state.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::error::AppResult;
use models::{
    AccountProjection, DeliveryState, LedgerEvent, PoolPoint, ReconCounts, ReconResult,
    SettlementFilter,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Cursor name for the chain indexer watermark (last indexed block)
pub const CURSOR_INDEXER: &str = "indexer_block";

/// Cursor name for the broker feed watermark (max observed_at, unix millis)
pub const CURSOR_BROKER_FEED: &str = "broker_feed_millis";

/// Storage seam shared by all three loops.
///
/// Every mutation here is a single-row upsert or insert-if-absent, so a
/// cycle abandoned mid-way is safe to resume. No method spans keys.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // ========== DELIVERY STATE ==========

    async fn upsert_delivery(&self, state: &DeliveryState) -> AppResult<()>;

    async fn get_delivery(&self, ref_id: &str) -> AppResult<Option<DeliveryState>>;

    /// Filtered listing for the query surface, newest first
    async fn list_deliveries(&self, filter: &SettlementFilter) -> AppResult<Vec<DeliveryState>>;

    /// Every delivery state ever recorded (reconciliation input)
    async fn all_deliveries(&self) -> AppResult<Vec<DeliveryState>>;

    // ========== LEDGER EVENTS ==========

    /// Insert keyed by (tx_hash, log_index); returns false when the event
    /// was already present. Re-ingesting a range is a no-op.
    async fn insert_event(&self, event: &LedgerEvent) -> AppResult<bool>;

    /// Events for one account, ordered by (block_number, log_index)
    async fn events_for_account(&self, account: &str) -> AppResult<Vec<LedgerEvent>>;

    /// All events, ordered by (block_number, log_index)
    async fn all_events(&self) -> AppResult<Vec<LedgerEvent>>;

    /// Events carrying a refId (reconciliation input)
    async fn events_with_ref(&self) -> AppResult<Vec<LedgerEvent>>;

    // ========== PROJECTIONS ==========

    async fn upsert_projection(&self, projection: &AccountProjection) -> AppResult<()>;

    async fn get_projection(&self, account: &str) -> AppResult<Option<AccountProjection>>;

    // ========== POOL ==========

    async fn upsert_pool_point(&self, point: &PoolPoint) -> AppResult<()>;

    async fn latest_pool_point(&self) -> AppResult<Option<PoolPoint>>;

    /// Pool history, newest first
    async fn pool_history(&self, limit: i64) -> AppResult<Vec<PoolPoint>>;

    // ========== RECONCILIATION ==========

    async fn upsert_recon(&self, result: &ReconResult) -> AppResult<()>;

    async fn get_recon(&self, ref_id: &str) -> AppResult<Option<ReconResult>>;

    async fn recon_counts(&self) -> AppResult<ReconCounts>;

    /// Current Break entries, oldest broker timestamp first
    async fn list_breaks(&self) -> AppResult<Vec<ReconResult>>;

    // ========== CURSORS ==========

    async fn get_cursor(&self, name: &str) -> AppResult<Option<i64>>;

    async fn set_cursor(&self, name: &str, position: i64) -> AppResult<()>;
}
