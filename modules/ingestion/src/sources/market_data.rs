use super::http::get_json;
use super::{SourceAdapter, SourceError};
use async_trait::async_trait;
use event_bus::SourceEvent;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub const SOURCE_SYSTEM: &str = "market_data";
pub const EVENT_TYPE: &str = "MARKET_PRICE_UPDATED";

#[derive(Deserialize)]
struct MarketSnapshot {
    #[serde(default)]
    timestamp: Option<String>,
    data: MarketData,
}

#[derive(Deserialize)]
struct MarketData {
    commodity_prices: BTreeMap<String, f64>,
    #[serde(default)]
    currency: Option<String>,
}

/// Commodity price feed; one event per commodity, keyed by commodity name
pub struct MarketDataAdapter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl MarketDataAdapter {
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
impl SourceAdapter for MarketDataAdapter {
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

        let snapshot: MarketSnapshot = get_json(request).await?;
        let timestamp = snapshot.timestamp;
        let currency = snapshot.data.currency;

        Ok(snapshot
            .data
            .commodity_prices
            .into_iter()
            .map(|(commodity, price)| SourceEvent {
                id: timestamp.as_ref().map(|ts| format!("{}@{}", commodity, ts)),
                event_type: Some(EVENT_TYPE.to_string()),
                entity_id: Some(commodity.clone()),
                timestamp: timestamp.clone(),
                data: Some(json!({
                    "commodity": commodity,
                    "price": price,
                    "currency": currency,
                })),
            })
            .collect())
    }
}
