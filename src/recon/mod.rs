//! Reconciliation engine - the authoritative cross-check between what the
//! bridge believes it submitted and what the chain confirmed.
//!
//! Every pass reclassifies every refId either side has ever seen and
//! upserts the verdict; nothing here is a log. A refId observed as Break
//! in one pass flips back to OK the moment the matching ledger event is
//! indexed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::AppResult;
use crate::store::models::{
    DeliveryState, DeliveryStatus, LedgerEvent, ReconCounts, ReconResult, ReconStatus,
};
use crate::store::SettlementStore;

/// Reconciliation tunables
#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub poll_interval: Duration,
    /// Age after which an unconfirmed delivery with no chain event becomes
    /// a Break
    pub break_threshold: ChronoDuration,
    /// Must match the bridge's retry budget - defines terminal Failed
    pub max_retries: i32,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            break_threshold: ChronoDuration::minutes(5),
            max_retries: 5,
        }
    }
}

/// Classify one refId from the join of delivery state and chain evidence.
///
/// Precedence: a terminally failed delivery is Failed regardless of chain
/// state; otherwise confirmed chain evidence is OK (this is what resolves
/// a Break once the event lands, even while the delivery row lags);
/// a Confirmed delivery the indexer has not caught up with stays Pending -
/// never a false OK; anything else ages into Break past the threshold.
pub fn classify(
    delivery: Option<&DeliveryState>,
    event: Option<&LedgerEvent>,
    now: DateTime<Utc>,
    break_threshold: ChronoDuration,
    max_retries: i32,
) -> ReconStatus {
    let Some(delivery) = delivery else {
        // Known only to the chain: confirmed by definition
        return ReconStatus::Ok;
    };

    if delivery.status == DeliveryStatus::Failed && delivery.attempts >= max_retries {
        return ReconStatus::Failed;
    }

    if event.is_some() {
        return ReconStatus::Ok;
    }

    if delivery.status == DeliveryStatus::Confirmed {
        return ReconStatus::Pending;
    }

    if now - delivery.created_at > break_threshold {
        return ReconStatus::Break;
    }

    ReconStatus::Pending
}

pub struct ReconEngine {
    store: Arc<dyn SettlementStore>,
    config: ReconConfig,
}

impl ReconEngine {
    pub fn new(store: Arc<dyn SettlementStore>, config: ReconConfig) -> Self {
        Self { store, config }
    }

    /// One reconciliation pass over the union of all known refIds.
    pub async fn reconcile(&self) -> AppResult<ReconCounts> {
        let now = Utc::now();

        let deliveries: HashMap<String, DeliveryState> = self
            .store
            .all_deliveries()
            .await?
            .into_iter()
            .map(|d| (d.ref_id.clone(), d))
            .collect();

        // First event per refId wins; the ledger's uniqueness check makes
        // a second mutation under the same refId impossible anyway.
        let mut events: HashMap<String, LedgerEvent> = HashMap::new();
        for event in self.store.events_with_ref().await? {
            if let Some(ref_id) = event.ref_id.clone() {
                events.entry(ref_id).or_insert(event);
            }
        }

        let ref_ids: BTreeSet<String> = deliveries
            .keys()
            .chain(events.keys())
            .cloned()
            .collect();

        for ref_id in &ref_ids {
            let delivery = deliveries.get(ref_id);
            let event = events.get(ref_id);
            let status = classify(
                delivery,
                event,
                now,
                self.config.break_threshold,
                self.config.max_retries,
            );

            let result = ReconResult {
                ref_id: ref_id.clone(),
                status,
                broker_timestamp: delivery.map(|d| d.created_at),
                chain_timestamp: event.map(|e| e.timestamp),
                chain_amount: event.map(|e| e.amount),
                chain_kind: event.map(|e| e.kind),
                checked_at: now,
            };
            self.store.upsert_recon(&result).await?;
        }

        let counts = self.store.recon_counts().await?;
        if counts.breaks > 0 || counts.failed > 0 {
            warn!(
                ok = counts.ok,
                pending = counts.pending,
                failed = counts.failed,
                breaks = counts.breaks,
                "reconciliation pass found discrepancies"
            );
        } else {
            info!(
                ok = counts.ok,
                pending = counts.pending,
                "reconciliation pass clean"
            );
        }

        Ok(counts)
    }

    /// Periodic loop; cycles never overlap and the loop exits on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "🔄 Reconciliation loop started (every {:?}, break threshold {})",
            self.config.poll_interval, self.config.break_threshold
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!("reconciliation pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reconciliation loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{derive_ref_id, BridgeConfig, DeliveryOutcome, SettlementBridge};
    use crate::indexer::{ChainIndexer, IndexerConfig};
    use crate::store::models::EventKind;
    use crate::store::{MemoryStore, SettlementStore};
    use crate::testutil::{
        delivery, ledger_event, raw_log, realized_record, test_schema, MockFeed, MockLedger,
    };
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn threshold() -> ChronoDuration {
        ChronoDuration::minutes(5)
    }

    fn aged(state: &mut DeliveryState, minutes: i64) {
        state.created_at = Utc::now() - ChronoDuration::minutes(minutes);
    }

    #[test]
    fn confirmed_with_event_is_ok() {
        let state = delivery("ref1", DeliveryStatus::Confirmed, 1, dec!(500));
        let event = ledger_event("0xt1", 0, 1, EventKind::Credited, Some("0xA"), 500, Some("ref1"));
        assert_eq!(
            classify(Some(&state), Some(&event), Utc::now(), threshold(), 5),
            ReconStatus::Ok
        );
    }

    #[test]
    fn exhausted_delivery_is_failed_regardless_of_age() {
        let mut state = delivery("ref1", DeliveryStatus::Failed, 5, dec!(500));
        aged(&mut state, 60);
        assert_eq!(
            classify(Some(&state), None, Utc::now(), threshold(), 5),
            ReconStatus::Failed
        );
    }

    #[test]
    fn retrying_delivery_is_pending_then_break() {
        let mut state = delivery("ref1", DeliveryStatus::Failed, 2, dec!(500));
        assert_eq!(
            classify(Some(&state), None, Utc::now(), threshold(), 5),
            ReconStatus::Pending
        );
        aged(&mut state, 6);
        assert_eq!(
            classify(Some(&state), None, Utc::now(), threshold(), 5),
            ReconStatus::Break
        );
    }

    #[test]
    fn stuck_pending_ages_into_break_and_event_resolves_it() {
        // The ambiguous crash case: attempt recorded, outcome never seen
        let mut state = delivery("ref1", DeliveryStatus::Pending, 1, dec!(500));
        aged(&mut state, 10);
        assert_eq!(
            classify(Some(&state), None, Utc::now(), threshold(), 5),
            ReconStatus::Break
        );

        let event = ledger_event("0xt1", 0, 1, EventKind::Credited, Some("0xA"), 500, Some("ref1"));
        assert_eq!(
            classify(Some(&state), Some(&event), Utc::now(), threshold(), 5),
            ReconStatus::Ok
        );
    }

    #[test]
    fn confirmed_without_event_stays_pending_never_false_ok() {
        let mut state = delivery("ref1", DeliveryStatus::Confirmed, 1, dec!(500));
        aged(&mut state, 60);
        assert_eq!(
            classify(Some(&state), None, Utc::now(), threshold(), 5),
            ReconStatus::Pending
        );
    }

    #[test]
    fn chain_only_ref_is_ok() {
        let event = ledger_event("0xt1", 0, 1, EventKind::Seized, Some("0xB"), 10, Some("refX"));
        assert_eq!(
            classify(None, Some(&event), Utc::now(), threshold(), 5),
            ReconStatus::Ok
        );
    }

    #[tokio::test]
    async fn pass_upserts_results_and_counts() {
        let store = Arc::new(MemoryStore::new());

        // One confirmed + indexed, one terminally failed, one aged break
        store
            .upsert_delivery(&delivery("ref_ok", DeliveryStatus::Confirmed, 1, dec!(100)))
            .await
            .unwrap();
        store
            .insert_event(&ledger_event(
                "0xt1",
                0,
                1,
                EventKind::Credited,
                Some("0xA"),
                100,
                Some("ref_ok"),
            ))
            .await
            .unwrap();

        store
            .upsert_delivery(&delivery("ref_dead", DeliveryStatus::Failed, 5, dec!(50)))
            .await
            .unwrap();

        let mut stuck = delivery("ref_stuck", DeliveryStatus::Pending, 1, dec!(10));
        aged(&mut stuck, 30);
        store.upsert_delivery(&stuck).await.unwrap();

        let engine = ReconEngine::new(store.clone(), ReconConfig::default());
        let counts = engine.reconcile().await.unwrap();
        assert_eq!(counts.ok, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.breaks, 1);
        assert_eq!(counts.pending, 0);

        let breaks = store.list_breaks().await.unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].ref_id, "ref_stuck");

        let ok = store.get_recon("ref_ok").await.unwrap().unwrap();
        assert_eq!(ok.chain_amount, Some(100));
        assert_eq!(ok.chain_kind, Some(EventKind::Credited));
    }

    #[tokio::test]
    async fn break_flips_back_to_ok_when_the_event_lands() {
        let store = Arc::new(MemoryStore::new());
        let mut stuck = delivery("ref1", DeliveryStatus::Pending, 1, dec!(10));
        aged(&mut stuck, 30);
        store.upsert_delivery(&stuck).await.unwrap();

        let engine = ReconEngine::new(store.clone(), ReconConfig::default());
        engine.reconcile().await.unwrap();
        assert_eq!(
            store.get_recon("ref1").await.unwrap().unwrap().status,
            ReconStatus::Break
        );

        // The indexer catches up between passes
        store
            .insert_event(&ledger_event(
                "0xt9",
                0,
                9,
                EventKind::Credited,
                Some("0xA"),
                10,
                Some("ref1"),
            ))
            .await
            .unwrap();

        engine.reconcile().await.unwrap();
        assert_eq!(
            store.get_recon("ref1").await.unwrap().unwrap().status,
            ReconStatus::Ok
        );
        assert!(store.list_breaks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn happy_path_across_bridge_indexer_and_recon() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let feed = Arc::new(MockFeed::new());

        let bridge = SettlementBridge::new(
            store.clone(),
            ledger.clone(),
            feed,
            BridgeConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );

        // Broker reports a 500-profit record; the bridge credits it
        let record = realized_record("r1", "0xA", dec!(500));
        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::Confirmed
        );
        let ref_id = derive_ref_id("r1");

        // The ledger emits the matching Credited event, which the indexer
        // picks up on its next cycle
        ledger.set_head(1).await;
        ledger
            .push_log(raw_log(
                "0xt1",
                0,
                1,
                "topic.credited",
                json!({"account": "0xA", "amount": 500_000_000u64, "ref_id": ref_id.as_str()}),
            ))
            .await;
        let indexer = ChainIndexer::new(
            store.clone(),
            ledger,
            test_schema(),
            IndexerConfig::default(),
        );
        indexer.catch_up().await.unwrap();

        let projection = store.get_projection("0xA").await.unwrap().unwrap();
        assert_eq!(projection.pnl, 500_000_000);

        // Reconciliation joins the two sides into OK
        let engine = ReconEngine::new(store.clone(), ReconConfig::default());
        let counts = engine.reconcile().await.unwrap();
        assert_eq!(counts.ok, 1);
        assert_eq!(counts.total(), 1);
        assert_eq!(
            store.get_recon(&ref_id).await.unwrap().unwrap().status,
            ReconStatus::Ok
        );
    }
}
