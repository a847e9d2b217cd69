//! Source adapters
//!
//! One adapter per external system of record. An adapter only fetches and
//! reshapes records into [`SourceEvent`]s; normalization, validation and
//! publishing are the supervisor's job.

mod erp;
mod exchange_rates;
mod http;
mod market_data;
mod weather;

pub use erp::ErpAdapter;
pub use exchange_rates::ExchangeRateAdapter;
pub use market_data::MarketDataAdapter;
pub use weather::WeatherAdapter;

use crate::config::Config;
use async_trait::async_trait;
use event_bus::SourceEvent;
use std::sync::Arc;
use std::time::Duration;

/// Adapter-level fetch failures; all of them send the poll loop to backoff
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("rate limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid response from source: {0}")]
    InvalidResponse(String),
}

impl SourceError {
    /// Short label used in metrics
    pub fn reason(&self) -> &'static str {
        match self {
            SourceError::ServiceUnavailable(_) => "service_unavailable",
            SourceError::RateLimited { .. } => "rate_limited",
            SourceError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// A system of record polled on a fixed interval
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stamped on every envelope produced from this source
    fn source_system(&self) -> &str;

    /// Nominal delay between two successful polls
    fn poll_interval(&self) -> Duration;

    /// Fetch the records available since the previous poll
    async fn fetch_data(&self) -> Result<Vec<SourceEvent>, SourceError>;
}

/// An adapter and the topic its envelopes go to
#[derive(Clone)]
pub struct SourceBinding {
    pub adapter: Arc<dyn SourceAdapter>,
    pub topic: String,
}

/// Instantiate every adapter enabled by `config`, sharing one HTTP client.
///
/// The ERP adapter is always present; the external adapters only when their
/// endpoint is configured.
pub fn build_adapters(config: &Config, client: reqwest::Client) -> Vec<SourceBinding> {
    let mut bindings = vec![SourceBinding {
        adapter: Arc::new(ErpAdapter::new(
            client.clone(),
            config.erp.base_url.clone(),
            config.erp.auth_token.clone(),
            config.erp.poll_interval,
        )),
        topic: config.erp_topic.clone(),
    }];

    if let Some(weather) = &config.weather {
        bindings.push(SourceBinding {
            adapter: Arc::new(WeatherAdapter::new(
                client.clone(),
                weather.url.clone(),
                weather.api_key.clone(),
                weather.poll_interval,
            )),
            topic: config.external_data_topic.clone(),
        });
    }

    if let Some(market) = &config.market_data {
        bindings.push(SourceBinding {
            adapter: Arc::new(MarketDataAdapter::new(
                client.clone(),
                market.url.clone(),
                market.api_key.clone(),
                market.poll_interval,
            )),
            topic: config.external_data_topic.clone(),
        });
    }

    if let Some(fx) = &config.exchange_rates {
        bindings.push(SourceBinding {
            adapter: Arc::new(ExchangeRateAdapter::new(
                client,
                fx.url.clone(),
                fx.api_key.clone(),
                fx.poll_interval,
            )),
            topic: config.external_data_topic.clone(),
        });
    }

    bindings
}
