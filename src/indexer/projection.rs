//! Pure folds from ordered ledger events to derived balances.
//!
//! Projections are recomputed in full for every touched account rather
//! than updated incrementally; account history is bounded and a full fold
//! cannot drift.

use chrono::{DateTime, Utc};

use crate::store::models::{AccountProjection, EventKind, LedgerEvent, PoolPoint};

/// Fold one account's events (ordered by block, log index) into balances.
///
/// Collateral decreases only on withdrawal or seizure; pnl increases only
/// on credit and decreases only on withdrawal. A withdrawal drains pnl
/// first and takes the remainder from collateral. The ledger rejects
/// operations that would go negative, so the saturation here never fires
/// on well-formed history - the projection just refuses to derive a
/// negative value from anything the chain confirmed.
pub fn project_account(account: &str, events: &[LedgerEvent]) -> AccountProjection {
    let mut collateral: u64 = 0;
    let mut pnl: u64 = 0;
    let mut updated_at: DateTime<Utc> = Utc::now();

    for event in events {
        match event.kind {
            EventKind::Deposited => collateral = collateral.saturating_add(event.amount),
            EventKind::Credited => pnl = pnl.saturating_add(event.amount),
            EventKind::Seized => collateral = collateral.saturating_sub(event.amount),
            EventKind::Withdrawn => {
                let from_pnl = event.amount.min(pnl);
                pnl -= from_pnl;
                collateral = collateral.saturating_sub(event.amount - from_pnl);
            }
            EventKind::BrokerDeposited | EventKind::BrokerWithdrawn => {}
        }
        updated_at = event.timestamp;
    }

    AccountProjection {
        account: account.to_string(),
        collateral,
        pnl,
        updated_at,
    }
}

/// Fold all events into the aggregate pool balance at the highest block
/// seen. Credits and seizures are internal reallocations and do not move
/// the pool's token balance; only deposits/withdrawals (user or broker
/// side) do. Returns None when there is no history yet.
pub fn pool_point(events: &[LedgerEvent]) -> Option<PoolPoint> {
    let mut balance: u64 = 0;
    let mut block_number: Option<i64> = None;
    let mut updated_at: DateTime<Utc> = Utc::now();

    for event in events {
        match event.kind {
            EventKind::Deposited | EventKind::BrokerDeposited => {
                balance = balance.saturating_add(event.amount)
            }
            EventKind::Withdrawn | EventKind::BrokerWithdrawn => {
                balance = balance.saturating_sub(event.amount)
            }
            EventKind::Credited | EventKind::Seized => {}
        }
        block_number = Some(block_number.map_or(event.block_number, |b: i64| b.max(event.block_number)));
        updated_at = event.timestamp;
    }

    block_number.map(|block_number| PoolPoint {
        block_number,
        balance,
        updated_at,
    })
}
