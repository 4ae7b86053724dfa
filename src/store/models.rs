use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status for a single broker record
///
/// Transitions are forward-only (Pending -> Confirmed | Failed), except
/// Failed -> Pending when a retry becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Confirmed => "confirmed",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "confirmed" => Some(DeliveryStatus::Confirmed),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-record delivery state - one row per refId, never deleted (audit trail)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryState {
    /// Deduplication identifier derived from the broker record id
    pub ref_id: String,
    /// Original broker record id
    pub broker_id: String,
    pub account: String,
    /// Signed broker amount (positive = profit, negative = loss)
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub tx_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryState {
    pub fn new(ref_id: String, broker_id: String, account: String, amount: Decimal) -> Self {
        Self {
            ref_id,
            broker_id,
            account,
            amount,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            tx_ref: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Kinds of entries in the ledger's event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Credited,
    Seized,
    Deposited,
    Withdrawn,
    BrokerDeposited,
    BrokerWithdrawn,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Credited => "credited",
            EventKind::Seized => "seized",
            EventKind::Deposited => "deposited",
            EventKind::Withdrawn => "withdrawn",
            EventKind::BrokerDeposited => "broker_deposited",
            EventKind::BrokerWithdrawn => "broker_withdrawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credited" => Some(EventKind::Credited),
            "seized" => Some(EventKind::Seized),
            "deposited" => Some(EventKind::Deposited),
            "withdrawn" => Some(EventKind::Withdrawn),
            "broker_deposited" => Some(EventKind::BrokerDeposited),
            "broker_withdrawn" => Some(EventKind::BrokerWithdrawn),
            _ => None,
        }
    }

    /// Map an event name as declared in the ledger's schema
    pub fn from_declared_name(name: &str) -> Option<Self> {
        match name {
            "Credited" => Some(EventKind::Credited),
            "Seized" => Some(EventKind::Seized),
            "Deposited" => Some(EventKind::Deposited),
            "Withdrawn" => Some(EventKind::Withdrawn),
            "BrokerDeposited" => Some(EventKind::BrokerDeposited),
            "BrokerWithdrawn" => Some(EventKind::BrokerWithdrawn),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A confirmed ledger log entry, keyed by (tx_hash, log_index)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub kind: EventKind,
    pub account: Option<String>,
    /// Unsigned amount in minor units
    pub amount: u64,
    pub ref_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Derived per-account balances, recomputed as a pure fold over the
/// account's ledger events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProjection {
    pub account: String,
    pub collateral: u64,
    pub pnl: u64,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate pool balance at a given block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPoint {
    pub block_number: i64,
    pub balance: u64,
    pub updated_at: DateTime<Utc>,
}

/// Reconciliation classification for a refId
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconStatus {
    Ok,
    Pending,
    Failed,
    Break,
}

impl ReconStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconStatus::Ok => "ok",
            ReconStatus::Pending => "pending",
            ReconStatus::Failed => "failed",
            ReconStatus::Break => "break",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(ReconStatus::Ok),
            "pending" => Some(ReconStatus::Pending),
            "failed" => Some(ReconStatus::Failed),
            "break" => Some(ReconStatus::Break),
            _ => None,
        }
    }
}

impl fmt::Display for ReconStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reconciliation verdict for a refId - a materialized view, upserted on
/// every pass, never appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconResult {
    pub ref_id: String,
    pub status: ReconStatus,
    pub broker_timestamp: Option<DateTime<Utc>>,
    pub chain_timestamp: Option<DateTime<Utc>>,
    pub chain_amount: Option<u64>,
    pub chain_kind: Option<EventKind>,
    pub checked_at: DateTime<Utc>,
}

/// Counts by reconciliation status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReconCounts {
    pub ok: i64,
    pub pending: i64,
    pub failed: i64,
    pub breaks: i64,
}

impl ReconCounts {
    pub fn total(&self) -> i64 {
        self.ok + self.pending + self.failed + self.breaks
    }
}

/// Filter for the settlement listing endpoint
#[derive(Debug, Clone, Default)]
pub struct SettlementFilter {
    pub account: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}
