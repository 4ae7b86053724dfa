//! Settlement ledger interface.
//!
//! The on-chain ledger is an external collaborator: two mutating entry
//! points (`credit`, `seize`), an idempotency-check query, and an
//! authoritative event log. Event decoding downstream is driven by the
//! schema the ledger declares, loaded once at startup - adding an event
//! kind on the ledger side does not require new constants here.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::LedgerError;

pub use http::HttpLedgerClient;

/// Receipt for a confirmed ledger mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: i64,
}

/// An undecoded entry from the ledger's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub tx_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    /// Topic identifying the event type, resolved through [`EventSchema`]
    pub topic: String,
    /// Event payload, shaped per the declared schema
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One event type as declared by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub topic: String,
    pub name: String,
    pub has_account: bool,
    pub has_ref: bool,
}

/// The ledger's declared event interface, keyed by topic
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    by_topic: HashMap<String, EventDescriptor>,
}

impl EventSchema {
    pub fn from_entries(entries: Vec<EventDescriptor>) -> Self {
        let by_topic = entries
            .into_iter()
            .map(|d| (d.topic.clone(), d))
            .collect();
        Self { by_topic }
    }

    pub fn descriptor(&self, topic: &str) -> Option<&EventDescriptor> {
        self.by_topic.get(topic)
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetch the ledger's declared event schema
    async fn load_schema(&self) -> Result<EventSchema, LedgerError>;

    /// Credit `amount` (minor units) of PnL to `account`. Fails with
    /// [`LedgerError::DuplicateRef`] and no state change if `ref_id` was
    /// already used.
    async fn credit(&self, account: &str, amount: u64, ref_id: &str)
        -> Result<TxReceipt, LedgerError>;

    /// Seize `amount` (minor units) of collateral from `account`. Same
    /// `ref_id` semantics as [`LedgerClient::credit`].
    async fn seize(&self, account: &str, amount: u64, ref_id: &str)
        -> Result<TxReceipt, LedgerError>;

    /// Pure query: has this refId been consumed on the ledger?
    async fn is_ref_used(&self, ref_id: &str) -> Result<bool, LedgerError>;

    /// Current head of the ledger's event log
    async fn head_block(&self) -> Result<i64, LedgerError>;

    /// Log entries in the block range `(from, to]`
    async fn fetch_logs(&self, from: i64, to: i64) -> Result<Vec<RawLog>, LedgerError>;
}
