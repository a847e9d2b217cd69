use super::http::get_json;
use super::{SourceAdapter, SourceError};
use async_trait::async_trait;
use event_bus::SourceEvent;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub const SOURCE_SYSTEM: &str = "exchange_rates";
pub const EVENT_TYPE: &str = "EXCHANGE_RATE_UPDATED";

#[derive(Deserialize)]
struct RateTable {
    #[serde(default)]
    timestamp: Option<String>,
    base: String,
    rates: BTreeMap<String, f64>,
}

/// FX rate feed; one event per pair, keyed `BASE/QUOTE`
pub struct ExchangeRateAdapter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl ExchangeRateAdapter {
    pub fn new(
        client: reqwest::Client,
        url: String,
        api_key: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            url,
            api_key,
            poll_interval,
        }
    }
}

#[async_trait]
impl SourceAdapter for ExchangeRateAdapter {
    fn source_system(&self) -> &str {
        SOURCE_SYSTEM
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn fetch_data(&self) -> Result<Vec<SourceEvent>, SourceError> {
        let mut request = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let table: RateTable = get_json(request).await?;
        let base = table.base.trim().to_uppercase();
        if base.is_empty() {
            return Err(SourceError::InvalidResponse("empty base currency".to_string()));
        }

        Ok(table
            .rates
            .into_iter()
            .filter(|(quote, _)| !quote.eq_ignore_ascii_case(&base))
            .map(|(quote, rate)| {
                let quote = quote.to_uppercase();
                let pair = format!("{}/{}", base, quote);
                SourceEvent {
                    id: table.timestamp.as_ref().map(|ts| format!("{}@{}", pair, ts)),
                    event_type: Some(EVENT_TYPE.to_string()),
                    entity_id: Some(pair),
                    timestamp: table.timestamp.clone(),
                    data: Some(json!({ "base": base, "quote": quote, "rate": rate })),
                }
            })
            .collect())
    }
}
