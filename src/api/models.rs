use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::models::{
    AccountProjection, DeliveryState, DeliveryStatus, PoolPoint, ReconCounts, ReconResult,
};

/// Per-account balances as derived by the indexer
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account: String,
    pub collateral: u64,
    pub pnl: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountProjection> for AccountResponse {
    fn from(p: AccountProjection) -> Self {
        Self {
            account: p.account,
            collateral: p.collateral,
            pnl: p.pnl,
            updated_at: p.updated_at,
        }
    }
}

/// Query parameters for the settlement listing
#[derive(Debug, Deserialize)]
pub struct SettlementsQuery {
    pub account: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One delivery row as exposed to operators
#[derive(Debug, Serialize)]
pub struct SettlementResponse {
    pub ref_id: String,
    pub broker_id: String,
    pub account: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub tx_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DeliveryState> for SettlementResponse {
    fn from(d: DeliveryState) -> Self {
        Self {
            ref_id: d.ref_id,
            broker_id: d.broker_id,
            account: d.account,
            amount: d.amount,
            status: d.status,
            attempts: d.attempts,
            tx_ref: d.tx_ref,
            last_error: d.last_error,
            created_at: d.created_at,
        }
    }
}

/// Delivery state joined with its current reconciliation verdict
#[derive(Debug, Serialize)]
pub struct SettlementDetailResponse {
    #[serde(flatten)]
    pub settlement: SettlementResponse,
    pub recon: Option<ReconResult>,
}

/// Counts by reconciliation status
#[derive(Debug, Serialize)]
pub struct ReconSummaryResponse {
    pub ok: i64,
    pub pending: i64,
    pub failed: i64,
    pub breaks: i64,
    pub total: i64,
}

impl From<ReconCounts> for ReconSummaryResponse {
    fn from(c: ReconCounts) -> Self {
        Self {
            ok: c.ok,
            pending: c.pending,
            failed: c.failed,
            breaks: c.breaks,
            total: c.total(),
        }
    }
}

/// Aggregate pool balance
#[derive(Debug, Serialize)]
pub struct PoolResponse {
    pub block_number: i64,
    pub balance: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<PoolPoint> for PoolResponse {
    fn from(p: PoolPoint) -> Self {
        Self {
            block_number: p.block_number,
            balance: p.balance,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolHistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub paused: bool,
}
