//! Broker feed - the pollable source of realized PnL records.
//!
//! The feed is an idempotent read and may return previously-seen records;
//! the bridge tolerates re-delivery.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

pub use http::HttpBrokerFeed;

/// Lifecycle of a broker record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Realized,
}

/// A realized-PnL record as reported by the broker. Immutable once
/// observed; identity is `id`, globally unique per broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: String,
    pub account: String,
    /// Signed amount: positive = profit to credit, negative = loss to seize
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub observed_at: DateTime<Utc>,
    pub status: RecordStatus,
}

impl SettlementRecord {
    pub fn is_realized(&self) -> bool {
        self.status == RecordStatus::Realized
    }
}

#[async_trait]
pub trait BrokerFeed: Send + Sync {
    /// List realized records, optionally only those observed at or after
    /// `since`. May return previously-seen records.
    async fn list_realized(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SettlementRecord>, FeedError>;
}
