//! Settlement bridge - turns each realized broker record into exactly one
//! ledger mutation, exactly once, despite restarts and transient failures.
//!
//! The dedup identifier (refId) is derived deterministically from the
//! broker record id, so re-observing the same record after a restart or a
//! duplicate feed response maps to the same delivery row. The Confirmed
//! short-circuit plus the ledger's own refId uniqueness check make the
//! externally observable effect at-most-once-successful.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerFeed, RecordStatus, SettlementRecord};
use crate::error::AppResult;
use crate::ledger::LedgerClient;
use crate::store::models::{DeliveryState, DeliveryStatus};
use crate::store::{SettlementStore, CURSOR_BROKER_FEED};

/// Bridge tunables
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    /// Delivery attempts after which a record is frozen at Failed
    pub max_retries: i32,
    /// Base delay for exponential backoff between retries
    pub retry_base: Duration,
    /// Backoff ceiling
    pub retry_cap: Duration,
    /// Decimal places of the settlement asset (broker decimal -> minor units)
    pub asset_scale: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_retries: 5,
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(300),
            asset_scale: 6,
        }
    }
}

/// What a single `process_record` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Record not yet realized by the broker - nothing to do
    NotRealized,
    /// Already confirmed under this refId - idempotent no-op
    AlreadyConfirmed,
    /// Frozen at Failed after exhausting retries
    RetriesExhausted,
    /// Waiting out the backoff window
    BackingOff,
    Confirmed,
    Failed,
}

/// Derive the canonical deduplication identifier for a broker record.
///
/// Deterministic and collision-resistant: the same broker id always maps
/// to the same refId, across processes and restarts.
pub fn derive_ref_id(broker_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"settlement:");
    hasher.update(broker_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Convert a non-negative broker decimal into minor units.
///
/// Returns None when the value has more precision than the asset scale or
/// does not fit in u64 - such a record can never settle and is surfaced
/// through the Failed path instead of being rounded.
pub fn to_minor_units(amount: Decimal, scale: u32) -> Option<u64> {
    if amount.is_sign_negative() {
        return None;
    }
    let factor = Decimal::from_i128_with_scale(10i128.checked_pow(scale)?, 0);
    let scaled = amount.checked_mul(factor)?;
    if scaled != scaled.trunc() {
        return None;
    }
    scaled.to_u64()
}

/// `min(base * 2^attempts, cap)`
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let factor = match 1u32.checked_shl(attempts) {
        Some(f) => f,
        None => return cap,
    };
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

pub struct SettlementBridge {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerClient>,
    feed: Arc<dyn BrokerFeed>,
    config: BridgeConfig,
    paused: Arc<AtomicBool>,
}

impl SettlementBridge {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerClient>,
        feed: Arc<dyn BrokerFeed>,
        config: BridgeConfig,
        paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            ledger,
            feed,
            config,
            paused,
        }
    }

    /// Deliver one realized broker record to the ledger.
    ///
    /// Safe to call any number of times for the same record: once the
    /// delivery is Confirmed every further call is a no-op, and the check
    /// happens before any network traffic.
    pub async fn process_record(&self, record: &SettlementRecord) -> AppResult<DeliveryOutcome> {
        if !record.is_realized() {
            return Ok(DeliveryOutcome::NotRealized);
        }

        let ref_id = derive_ref_id(&record.id);

        let existing = self.store.get_delivery(&ref_id).await?;
        if let Some(state) = &existing {
            if state.status == DeliveryStatus::Confirmed {
                debug!(ref_id = %state.ref_id, "delivery already confirmed, skipping");
                return Ok(DeliveryOutcome::AlreadyConfirmed);
            }
        }

        let mut state = match existing {
            Some(state) => state,
            None => {
                let state = DeliveryState::new(
                    ref_id.clone(),
                    record.id.clone(),
                    record.account.clone(),
                    record.amount,
                );
                self.store.upsert_delivery(&state).await?;
                state
            }
        };

        if state.attempts >= self.config.max_retries {
            return Ok(DeliveryOutcome::RetriesExhausted);
        }

        if state.status == DeliveryStatus::Failed {
            let delay = backoff_delay(
                state.attempts as u32,
                self.config.retry_base,
                self.config.retry_cap,
            );
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            if let Some(last) = state.last_attempt_at {
                if Utc::now() < last + delay {
                    return Ok(DeliveryOutcome::BackingOff);
                }
            }
        }

        if record.amount.is_zero() {
            // Nothing to settle - confirm trivially so the refId is closed
            state.status = DeliveryStatus::Confirmed;
            self.store.upsert_delivery(&state).await?;
            return Ok(DeliveryOutcome::Confirmed);
        }

        let magnitude = match to_minor_units(record.amount.abs(), self.config.asset_scale) {
            Some(m) => m,
            None => {
                state.attempts += 1;
                state.status = DeliveryStatus::Failed;
                state.last_attempt_at = Some(Utc::now());
                state.last_error = Some(format!(
                    "amount {} not representable at scale {}",
                    record.amount, self.config.asset_scale
                ));
                self.store.upsert_delivery(&state).await?;
                return Ok(DeliveryOutcome::Failed);
            }
        };

        // Record the attempt durably BEFORE touching the network. A crash
        // between here and the confirmation leaves a visible in-flight row
        // for reconciliation to age out, never a silent loss.
        state.attempts += 1;
        state.status = DeliveryStatus::Pending;
        state.last_attempt_at = Some(Utc::now());
        self.store.upsert_delivery(&state).await?;

        let submission = if record.amount.is_sign_positive() {
            self.ledger.credit(&record.account, magnitude, &ref_id).await
        } else {
            self.ledger.seize(&record.account, magnitude, &ref_id).await
        };

        match submission {
            Ok(receipt) => {
                info!(
                    ref_id = %state.ref_id,
                    account = %record.account,
                    tx = %receipt.tx_hash,
                    "settlement confirmed"
                );
                state.status = DeliveryStatus::Confirmed;
                state.tx_ref = Some(receipt.tx_hash);
                state.last_error = None;
            }
            Err(e) if e.is_duplicate_ref() => {
                // The ledger consumed this refId under an earlier attempt
                // (e.g. a submission whose confirmation we never saw).
                // Success-equivalent: never re-attempt.
                info!(ref_id = %state.ref_id, "refId already used on ledger, treating as confirmed");
                state.status = DeliveryStatus::Confirmed;
                state.last_error = None;
            }
            Err(e) => {
                warn!(
                    ref_id = %state.ref_id,
                    attempts = state.attempts,
                    "settlement submission failed: {}",
                    e
                );
                state.status = DeliveryStatus::Failed;
                state.last_error = Some(e.to_string());
            }
        }

        self.store.upsert_delivery(&state).await?;

        Ok(if state.status == DeliveryStatus::Confirmed {
            DeliveryOutcome::Confirmed
        } else {
            DeliveryOutcome::Failed
        })
    }

    /// One bridge cycle: poll the feed for realized records and deliver
    /// each, then sweep stored Failed deliveries that are due for a retry.
    ///
    /// A failure on one record never aborts the rest; an unreachable feed
    /// skips the fetch (the sweep still runs).
    pub async fn poll_cycle(&self) -> AppResult<()> {
        if self.paused.load(Ordering::Relaxed) {
            debug!("bridge paused, skipping cycle");
            return Ok(());
        }

        let since = match self.store.get_cursor(CURSOR_BROKER_FEED).await? {
            Some(millis) => chrono::DateTime::from_timestamp_millis(millis),
            None => None,
        };

        match self.feed.list_realized(since).await {
            Ok(records) => {
                let mut watermark = since;
                for record in &records {
                    if !record.is_realized() {
                        continue;
                    }
                    if let Err(e) = self.process_record(record).await {
                        error!("delivery of broker record {} failed: {}", record.id, e);
                    }
                    if watermark.map_or(true, |w| record.observed_at > w) {
                        watermark = Some(record.observed_at);
                    }
                }
                if let Some(w) = watermark {
                    if Some(w) != since {
                        self.store
                            .set_cursor(CURSOR_BROKER_FEED, w.timestamp_millis())
                            .await?;
                    }
                }
            }
            Err(e) => {
                warn!("broker feed unreachable, skipping fetch: {}", e);
            }
        }

        self.retry_sweep().await
    }

    /// Re-drive stored deliveries that failed with an explicit rejection
    /// or network error and still have retry budget. Backoff gating
    /// happens inside `process_record`. Pending rows are deliberately NOT
    /// swept: an in-flight submission with an unknown outcome is resolved
    /// by reconciliation, not guessed at.
    async fn retry_sweep(&self) -> AppResult<()> {
        let deliveries = self.store.all_deliveries().await?;
        for state in deliveries {
            if state.status != DeliveryStatus::Failed || state.attempts >= self.config.max_retries
            {
                continue;
            }
            let record = SettlementRecord {
                id: state.broker_id.clone(),
                account: state.account.clone(),
                amount: state.amount,
                observed_at: state.created_at,
                status: RecordStatus::Realized,
            };
            if let Err(e) = self.process_record(&record).await {
                error!("retry of broker record {} failed: {}", record.id, e);
            }
        }
        Ok(())
    }

    /// Periodic loop. Cycles never overlap (the tick awaits the cycle) and
    /// the loop exits on the shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "🔄 Settlement bridge loop started (every {:?})",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_cycle().await {
                        error!("bridge cycle failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Settlement bridge loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{realized_record, MockFeed, MockLedger};
    use rust_decimal_macros::dec;

    fn bridge_with(
        config: BridgeConfig,
    ) -> (Arc<MemoryStore>, Arc<MockLedger>, Arc<MockFeed>, SettlementBridge) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let feed = Arc::new(MockFeed::new());
        let bridge = SettlementBridge::new(
            store.clone(),
            ledger.clone(),
            feed.clone(),
            config,
            Arc::new(AtomicBool::new(false)),
        );
        (store, ledger, feed, bridge)
    }

    fn default_bridge() -> (Arc<MemoryStore>, Arc<MockLedger>, Arc<MockFeed>, SettlementBridge) {
        bridge_with(BridgeConfig {
            retry_base: Duration::from_secs(0),
            ..BridgeConfig::default()
        })
    }

    #[test]
    fn ref_id_is_deterministic_and_distinct() {
        assert_eq!(derive_ref_id("r1"), derive_ref_id("r1"));
        assert_ne!(derive_ref_id("r1"), derive_ref_id("r2"));
        assert_eq!(derive_ref_id("r1").len(), 64);
    }

    #[test]
    fn minor_unit_conversion() {
        assert_eq!(to_minor_units(dec!(500), 6), Some(500_000_000));
        assert_eq!(to_minor_units(dec!(0.25), 6), Some(250_000));
        assert_eq!(to_minor_units(dec!(0.0000001), 6), None);
        assert_eq!(to_minor_units(dec!(-1), 6), None);
    }

    #[test]
    fn backoff_is_monotonic_up_to_cap() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let delays: Vec<Duration> = (0..8).map(|a| backoff_delay(a, base, cap)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[7], cap);
        assert_eq!(backoff_delay(40, base, cap), cap);
    }

    #[tokio::test]
    async fn happy_path_credits_once() {
        let (store, ledger, _, bridge) = default_bridge();
        let record = realized_record("r1", "0xA", dec!(500));

        let outcome = bridge.process_record(&record).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Confirmed);

        let calls = ledger.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, "credit");
        assert_eq!(calls[0].account, "0xA");
        assert_eq!(calls[0].amount, 500_000_000);
        assert_eq!(calls[0].ref_id, derive_ref_id("r1"));

        let state = store
            .get_delivery(&derive_ref_id("r1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Confirmed);
        assert_eq!(state.attempts, 1);
        assert!(state.tx_ref.is_some());
    }

    #[tokio::test]
    async fn second_call_is_a_no_op() {
        let (_, ledger, _, bridge) = default_bridge();
        let record = realized_record("r1", "0xA", dec!(500));

        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::Confirmed
        );
        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::AlreadyConfirmed
        );
        assert_eq!(ledger.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn loss_maps_to_seizure_of_magnitude() {
        let (_, ledger, _, bridge) = default_bridge();
        let record = realized_record("r2", "0xB", dec!(-200));

        let outcome = bridge.process_record(&record).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Confirmed);

        let calls = ledger.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, "seize");
        assert_eq!(calls[0].amount, 200_000_000);
    }

    #[tokio::test]
    async fn zero_amount_confirms_without_submission() {
        let (store, ledger, _, bridge) = default_bridge();
        let record = realized_record("r3", "0xC", dec!(0));

        let outcome = bridge.process_record(&record).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Confirmed);
        assert!(ledger.calls().await.is_empty());

        let state = store
            .get_delivery(&derive_ref_id("r3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Confirmed);
        assert_eq!(state.attempts, 0);
    }

    #[tokio::test]
    async fn retries_freeze_at_failed_after_max_attempts() {
        let (store, ledger, _, bridge) = default_bridge();
        ledger.fail_next(100).await;
        let record = realized_record("r4", "0xD", dec!(10));

        for _ in 0..5 {
            assert_eq!(
                bridge.process_record(&record).await.unwrap(),
                DeliveryOutcome::Failed
            );
        }
        // Budget exhausted - no further submission attempts, ever
        for _ in 0..3 {
            assert_eq!(
                bridge.process_record(&record).await.unwrap(),
                DeliveryOutcome::RetriesExhausted
            );
        }
        assert_eq!(ledger.calls().await.len(), 5);

        let state = store
            .get_delivery(&derive_ref_id("r4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Failed);
        assert_eq!(state.attempts, 5);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn failed_delivery_backs_off_between_attempts() {
        let (_, ledger, _, bridge) = bridge_with(BridgeConfig {
            retry_base: Duration::from_secs(3600),
            ..BridgeConfig::default()
        });
        ledger.fail_next(100).await;
        let record = realized_record("r5", "0xE", dec!(10));

        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::Failed
        );
        // Immediately retrying is gated by the hour-long backoff window
        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::BackingOff
        );
        assert_eq!(ledger.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ref_rejection_is_success_equivalent() {
        let (store, ledger, _, bridge) = default_bridge();
        ledger.mark_ref_used(&derive_ref_id("r6")).await;
        let record = realized_record("r6", "0xF", dec!(42));

        let outcome = bridge.process_record(&record).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Confirmed);

        let state = store
            .get_delivery(&derive_ref_id("r6"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Confirmed);
        // No receipt was ever observed for this delivery
        assert!(state.tx_ref.is_none());

        // And it is never re-attempted
        assert_eq!(
            bridge.process_record(&record).await.unwrap(),
            DeliveryOutcome::AlreadyConfirmed
        );
        assert_eq!(ledger.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn attempt_is_recorded_before_submission() {
        let (store, ledger, _, bridge) = default_bridge();
        ledger.fail_next(1).await;
        let record = realized_record("r7", "0xAA", dec!(5));

        bridge.process_record(&record).await.unwrap();

        let state = store
            .get_delivery(&derive_ref_id("r7"))
            .await
            .unwrap()
            .unwrap();
        // The failed network call still left a durable attempt behind
        assert_eq!(state.attempts, 1);
        assert!(state.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_feed_delivery_submits_once() {
        let (_, ledger, feed, bridge) = default_bridge();
        let record = realized_record("r1", "0xA", dec!(500));
        feed.push(record.clone()).await;

        bridge.poll_cycle().await.unwrap();
        // Same record returned again on the next poll
        feed.push(record).await;
        bridge.poll_cycle().await.unwrap();

        assert_eq!(ledger.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_the_cycle() {
        let (store, ledger, feed, bridge) = default_bridge();
        ledger.fail_ref(&derive_ref_id("bad")).await;
        feed.push(realized_record("bad", "0xA", dec!(1))).await;
        feed.push(realized_record("good", "0xB", dec!(2))).await;

        bridge.poll_cycle().await.unwrap();

        let good = store
            .get_delivery(&derive_ref_id("good"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(good.status, DeliveryStatus::Confirmed);
        let bad = store
            .get_delivery(&derive_ref_id("bad"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn failed_records_are_retried_by_the_sweep() {
        let (store, ledger, feed, bridge) = default_bridge();
        ledger.fail_ref(&derive_ref_id("r9")).await;
        feed.push(realized_record("r9", "0xA", dec!(7))).await;

        bridge.poll_cycle().await.unwrap();
        let state = store
            .get_delivery(&derive_ref_id("r9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Failed);
        let attempts_so_far = state.attempts;
        assert!(attempts_so_far >= 1);

        // Ledger recovers; the feed returns nothing new, so only the sweep
        // can re-drive the stored failure
        ledger.clear_failures().await;
        bridge.poll_cycle().await.unwrap();
        let state = store
            .get_delivery(&derive_ref_id("r9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, DeliveryStatus::Confirmed);
        assert_eq!(state.attempts, attempts_so_far + 1);
    }

    #[tokio::test]
    async fn paused_bridge_submits_nothing() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new());
        let feed = Arc::new(MockFeed::new());
        let paused = Arc::new(AtomicBool::new(true));
        let bridge = SettlementBridge::new(
            store,
            ledger.clone(),
            feed.clone(),
            BridgeConfig::default(),
            paused.clone(),
        );

        feed.push(realized_record("r1", "0xA", dec!(500))).await;
        bridge.poll_cycle().await.unwrap();
        assert!(ledger.calls().await.is_empty());

        paused.store(false, Ordering::Relaxed);
        bridge.poll_cycle().await.unwrap();
        assert_eq!(ledger.calls().await.len(), 1);
    }
}
