use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{BrokerFeed, SettlementRecord};
use crate::error::FeedError;

/// HTTP client for the broker's realized-PnL endpoint
pub struct HttpBrokerFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBrokerFeed {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BrokerFeed for HttpBrokerFeed {
    async fn list_realized(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SettlementRecord>, FeedError> {
        let url = format!("{}/settlements/realized", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Http(format!(
                "broker feed returned {}",
                response.status()
            )));
        }

        response
            .json::<Vec<SettlementRecord>>()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))
    }
}
