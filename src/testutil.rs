//! Shared test fixtures: scriptable in-memory doubles for the ledger and
//! the broker feed, plus model constructors.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::broker::{BrokerFeed, RecordStatus, SettlementRecord};
use crate::error::{FeedError, LedgerError};
use crate::ledger::{EventDescriptor, EventSchema, LedgerClient, RawLog, TxReceipt};
use crate::store::models::{DeliveryState, DeliveryStatus, EventKind, LedgerEvent};

/// One recorded mutation submission
#[derive(Debug, Clone)]
pub struct LedgerCall {
    pub op: &'static str,
    pub account: String,
    pub amount: u64,
    pub ref_id: String,
}

/// Scriptable ledger double. Mutations succeed unless failures are queued
/// with `fail_next`; a refId submitted twice is rejected the way the real
/// ledger rejects it.
#[derive(Default)]
pub struct MockLedger {
    calls: Mutex<Vec<LedgerCall>>,
    used_refs: Mutex<HashSet<String>>,
    fail_next: Mutex<u32>,
    fail_refs: Mutex<HashSet<String>>,
    head: Mutex<i64>,
    logs: Mutex<Vec<RawLog>>,
    fetches: Mutex<Vec<(i64, i64)>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<LedgerCall> {
        self.calls.lock().await.clone()
    }

    /// Make the next `n` mutation submissions fail with an RPC error
    pub async fn fail_next(&self, n: u32) {
        *self.fail_next.lock().await = n;
    }

    /// Make every submission under this refId fail with an RPC error
    pub async fn fail_ref(&self, ref_id: &str) {
        self.fail_refs.lock().await.insert(ref_id.to_string());
    }

    /// Clear all scripted failures
    pub async fn clear_failures(&self) {
        *self.fail_next.lock().await = 0;
        self.fail_refs.lock().await.clear();
    }

    /// Pre-consume a refId, as if an earlier submission already landed
    pub async fn mark_ref_used(&self, ref_id: &str) {
        self.used_refs.lock().await.insert(ref_id.to_string());
    }

    pub async fn set_head(&self, head: i64) {
        *self.head.lock().await = head;
    }

    pub async fn push_log(&self, log: RawLog) {
        self.logs.lock().await.push(log);
    }

    /// Ranges requested through fetch_logs, in order
    pub async fn log_fetches(&self) -> Vec<(i64, i64)> {
        self.fetches.lock().await.clone()
    }

    async fn submit(
        &self,
        op: &'static str,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        let mut calls = self.calls.lock().await;
        calls.push(LedgerCall {
            op,
            account: account.to_string(),
            amount,
            ref_id: ref_id.to_string(),
        });
        let call_count = calls.len();
        drop(calls);

        let mut fail_next = self.fail_next.lock().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(LedgerError::Rpc("connection reset".to_string()));
        }
        drop(fail_next);

        if self.fail_refs.lock().await.contains(ref_id) {
            return Err(LedgerError::Rpc("connection reset".to_string()));
        }

        let mut used = self.used_refs.lock().await;
        if !used.insert(ref_id.to_string()) {
            return Err(LedgerError::DuplicateRef(ref_id.to_string()));
        }

        Ok(TxReceipt {
            tx_hash: format!("0xmock{}", call_count),
            block_number: call_count as i64,
        })
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn load_schema(&self) -> Result<EventSchema, LedgerError> {
        Ok(test_schema())
    }

    async fn credit(
        &self,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.submit("credit", account, amount, ref_id).await
    }

    async fn seize(
        &self,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.submit("seize", account, amount, ref_id).await
    }

    async fn is_ref_used(&self, ref_id: &str) -> Result<bool, LedgerError> {
        Ok(self.used_refs.lock().await.contains(ref_id))
    }

    async fn head_block(&self) -> Result<i64, LedgerError> {
        Ok(*self.head.lock().await)
    }

    async fn fetch_logs(&self, from: i64, to: i64) -> Result<Vec<RawLog>, LedgerError> {
        self.fetches.lock().await.push((from, to));
        Ok(self
            .logs
            .lock()
            .await
            .iter()
            .filter(|l| l.block_number > from && l.block_number <= to)
            .cloned()
            .collect())
    }
}

/// Queue-backed broker feed double: each poll drains what was pushed.
#[derive(Default)]
pub struct MockFeed {
    queue: Mutex<Vec<SettlementRecord>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: SettlementRecord) {
        self.queue.lock().await.push(record);
    }
}

#[async_trait]
impl BrokerFeed for MockFeed {
    async fn list_realized(
        &self,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SettlementRecord>, FeedError> {
        Ok(std::mem::take(&mut *self.queue.lock().await))
    }
}

/// The event schema a well-behaved ledger declares
pub fn test_schema() -> EventSchema {
    EventSchema::from_entries(vec![
        EventDescriptor {
            topic: "topic.credited".to_string(),
            name: "Credited".to_string(),
            has_account: true,
            has_ref: true,
        },
        EventDescriptor {
            topic: "topic.seized".to_string(),
            name: "Seized".to_string(),
            has_account: true,
            has_ref: true,
        },
        EventDescriptor {
            topic: "topic.deposited".to_string(),
            name: "Deposited".to_string(),
            has_account: true,
            has_ref: false,
        },
        EventDescriptor {
            topic: "topic.withdrawn".to_string(),
            name: "Withdrawn".to_string(),
            has_account: true,
            has_ref: false,
        },
        EventDescriptor {
            topic: "topic.broker_deposited".to_string(),
            name: "BrokerDeposited".to_string(),
            has_account: false,
            has_ref: false,
        },
        EventDescriptor {
            topic: "topic.broker_withdrawn".to_string(),
            name: "BrokerWithdrawn".to_string(),
            has_account: false,
            has_ref: false,
        },
    ])
}

pub fn realized_record(id: &str, account: &str, amount: Decimal) -> SettlementRecord {
    SettlementRecord {
        id: id.to_string(),
        account: account.to_string(),
        amount,
        observed_at: Utc::now(),
        status: RecordStatus::Realized,
    }
}

pub fn ledger_event(
    tx_hash: &str,
    log_index: i64,
    block_number: i64,
    kind: EventKind,
    account: Option<&str>,
    amount: u64,
    ref_id: Option<&str>,
) -> LedgerEvent {
    LedgerEvent {
        tx_hash: tx_hash.to_string(),
        log_index,
        block_number,
        kind,
        account: account.map(str::to_string),
        amount,
        ref_id: ref_id.map(str::to_string),
        timestamp: Utc::now(),
    }
}

pub fn raw_log(
    tx_hash: &str,
    log_index: i64,
    block_number: i64,
    topic: &str,
    data: serde_json::Value,
) -> RawLog {
    RawLog {
        tx_hash: tx_hash.to_string(),
        block_number,
        log_index,
        topic: topic.to_string(),
        data,
        timestamp: Utc::now(),
    }
}

pub fn delivery(
    ref_id: &str,
    status: DeliveryStatus,
    attempts: i32,
    amount: Decimal,
) -> DeliveryState {
    DeliveryState {
        ref_id: ref_id.to_string(),
        broker_id: format!("{}_src", ref_id),
        account: "0xA".to_string(),
        amount,
        status,
        attempts,
        last_attempt_at: if attempts > 0 { Some(Utc::now()) } else { None },
        tx_ref: None,
        last_error: None,
        created_at: Utc::now(),
    }
}
