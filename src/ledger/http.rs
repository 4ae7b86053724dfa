use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EventDescriptor, EventSchema, LedgerClient, RawLog, TxReceipt};
use crate::error::LedgerError;

/// HTTP client for the ledger node's settlement gateway
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct MutationRequest<'a> {
    account: &'a str,
    amount: u64,
    ref_id: &'a str,
}

#[derive(Deserialize)]
struct MutationRejection {
    error_code: String,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct HeadResponse {
    block_number: i64,
}

#[derive(Deserialize)]
struct RefUsedResponse {
    used: bool,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn submit_mutation(
        &self,
        path: &str,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&MutationRequest {
                account,
                amount,
                ref_id,
            })
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TxReceipt>()
                .await
                .map_err(|e| LedgerError::Rpc(format!("bad receipt payload: {}", e)));
        }

        // Distinguish the duplicate-refId rejection from everything else:
        // it is the only rejection that is success-equivalent upstream.
        let rejection = response.json::<MutationRejection>().await.ok();
        match rejection {
            Some(r) if r.error_code == "REF_ALREADY_USED" => {
                Err(LedgerError::DuplicateRef(ref_id.to_string()))
            }
            Some(r) => Err(LedgerError::Reverted(format!(
                "{} ({})",
                r.error, r.error_code
            ))),
            None => Err(LedgerError::Rpc(format!("ledger returned {}", status))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, LedgerError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Rpc(format!(
                "ledger returned {}",
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn load_schema(&self) -> Result<EventSchema, LedgerError> {
        let entries: Vec<EventDescriptor> = self
            .get_json("events/schema")
            .await
            .map_err(|e| LedgerError::Schema(e.to_string()))?;

        if entries.is_empty() {
            return Err(LedgerError::Schema(
                "ledger declared an empty event schema".to_string(),
            ));
        }

        Ok(EventSchema::from_entries(entries))
    }

    async fn credit(
        &self,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.submit_mutation("credit", account, amount, ref_id).await
    }

    async fn seize(
        &self,
        account: &str,
        amount: u64,
        ref_id: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.submit_mutation("seize", account, amount, ref_id).await
    }

    async fn is_ref_used(&self, ref_id: &str) -> Result<bool, LedgerError> {
        let response: RefUsedResponse = self.get_json(&format!("refs/{}", ref_id)).await?;
        Ok(response.used)
    }

    async fn head_block(&self) -> Result<i64, LedgerError> {
        let response: HeadResponse = self.get_json("head").await?;
        Ok(response.block_number)
    }

    async fn fetch_logs(&self, from: i64, to: i64) -> Result<Vec<RawLog>, LedgerError> {
        self.get_json(&format!("logs?from={}&to={}", from, to)).await
    }
}
