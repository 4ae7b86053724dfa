//! In-memory store backend.
//!
//! Used by the test suite and selectable via `STORE_BACKEND=memory` for
//! local development without a database. State does not survive a restart,
//! which reintroduces the double-settlement risk the Postgres backend
//! exists to prevent - never run this backend against a real ledger.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use super::models::{
    AccountProjection, DeliveryState, LedgerEvent, PoolPoint, ReconCounts, ReconResult,
    ReconStatus, SettlementFilter,
};
use super::SettlementStore;
use crate::error::AppResult;

#[derive(Default)]
pub struct MemoryStore {
    deliveries: RwLock<HashMap<String, DeliveryState>>,
    events: RwLock<BTreeMap<(i64, i64, String), LedgerEvent>>,
    event_keys: RwLock<HashSet<(String, i64)>>,
    projections: RwLock<HashMap<String, AccountProjection>>,
    pool: RwLock<BTreeMap<i64, PoolPoint>>,
    recon: RwLock<HashMap<String, ReconResult>>,
    cursors: RwLock<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn upsert_delivery(&self, state: &DeliveryState) -> AppResult<()> {
        let mut deliveries = self.deliveries.write().await;
        deliveries.insert(state.ref_id.clone(), state.clone());
        Ok(())
    }

    async fn get_delivery(&self, ref_id: &str) -> AppResult<Option<DeliveryState>> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries.get(ref_id).cloned())
    }

    async fn list_deliveries(&self, filter: &SettlementFilter) -> AppResult<Vec<DeliveryState>> {
        let deliveries = self.deliveries.read().await;
        let mut matched: Vec<DeliveryState> = deliveries
            .values()
            .filter(|d| {
                filter.account.as_deref().map_or(true, |a| d.account == a)
                    && filter.from.map_or(true, |from| d.created_at >= from)
                    && filter.to.map_or(true, |to| d.created_at <= to)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(0) as usize;
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn all_deliveries(&self) -> AppResult<Vec<DeliveryState>> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries.values().cloned().collect())
    }

    async fn insert_event(&self, event: &LedgerEvent) -> AppResult<bool> {
        let key = (event.tx_hash.clone(), event.log_index);
        let mut event_keys = self.event_keys.write().await;
        if !event_keys.insert(key) {
            return Ok(false);
        }
        let mut events = self.events.write().await;
        events.insert(
            (event.block_number, event.log_index, event.tx_hash.clone()),
            event.clone(),
        );
        Ok(true)
    }

    async fn events_for_account(&self, account: &str) -> AppResult<Vec<LedgerEvent>> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| e.account.as_deref() == Some(account))
            .cloned()
            .collect())
    }

    async fn all_events(&self) -> AppResult<Vec<LedgerEvent>> {
        let events = self.events.read().await;
        Ok(events.values().cloned().collect())
    }

    async fn events_with_ref(&self) -> AppResult<Vec<LedgerEvent>> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| e.ref_id.is_some())
            .cloned()
            .collect())
    }

    async fn upsert_projection(&self, projection: &AccountProjection) -> AppResult<()> {
        let mut projections = self.projections.write().await;
        projections.insert(projection.account.clone(), projection.clone());
        Ok(())
    }

    async fn get_projection(&self, account: &str) -> AppResult<Option<AccountProjection>> {
        let projections = self.projections.read().await;
        Ok(projections.get(account).cloned())
    }

    async fn upsert_pool_point(&self, point: &PoolPoint) -> AppResult<()> {
        let mut pool = self.pool.write().await;
        pool.insert(point.block_number, point.clone());
        Ok(())
    }

    async fn latest_pool_point(&self) -> AppResult<Option<PoolPoint>> {
        let pool = self.pool.read().await;
        Ok(pool.values().next_back().cloned())
    }

    async fn pool_history(&self, limit: i64) -> AppResult<Vec<PoolPoint>> {
        let pool = self.pool.read().await;
        Ok(pool
            .values()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn upsert_recon(&self, result: &ReconResult) -> AppResult<()> {
        let mut recon = self.recon.write().await;
        recon.insert(result.ref_id.clone(), result.clone());
        Ok(())
    }

    async fn get_recon(&self, ref_id: &str) -> AppResult<Option<ReconResult>> {
        let recon = self.recon.read().await;
        Ok(recon.get(ref_id).cloned())
    }

    async fn recon_counts(&self) -> AppResult<ReconCounts> {
        let recon = self.recon.read().await;
        let mut counts = ReconCounts::default();
        for result in recon.values() {
            match result.status {
                ReconStatus::Ok => counts.ok += 1,
                ReconStatus::Pending => counts.pending += 1,
                ReconStatus::Failed => counts.failed += 1,
                ReconStatus::Break => counts.breaks += 1,
            }
        }
        Ok(counts)
    }

    async fn list_breaks(&self) -> AppResult<Vec<ReconResult>> {
        let recon = self.recon.read().await;
        let mut breaks: Vec<ReconResult> = recon
            .values()
            .filter(|r| r.status == ReconStatus::Break)
            .cloned()
            .collect();
        breaks.sort_by(|a, b| a.broker_timestamp.cmp(&b.broker_timestamp));
        Ok(breaks)
    }

    async fn get_cursor(&self, name: &str) -> AppResult<Option<i64>> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(name).copied())
    }

    async fn set_cursor(&self, name: &str, position: i64) -> AppResult<()> {
        let mut cursors = self.cursors.write().await;
        cursors.insert(name.to_string(), position);
        Ok(())
    }
}
