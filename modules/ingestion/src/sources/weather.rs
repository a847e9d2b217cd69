use super::http::get_json;
use super::{SourceAdapter, SourceError};
use async_trait::async_trait;
use event_bus::SourceEvent;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

pub const SOURCE_SYSTEM: &str = "weather";
pub const EVENT_TYPE: &str = "WEATHER_OBSERVED";

#[derive(Deserialize)]
struct WeatherReport {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Current conditions at a site, one `WEATHER_OBSERVED` event per poll
///
/// Keyed by the reported `location`; a report without one is passed on and
/// rejected at normalization.
pub struct WeatherAdapter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl WeatherAdapter {
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
impl SourceAdapter for WeatherAdapter {
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

        let report: WeatherReport = get_json(request).await?;
        let location = report
            .data
            .get("location")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = match (&location, &report.timestamp) {
            (Some(location), Some(ts)) => Some(format!("{}@{}", location, ts)),
            _ => None,
        };

        Ok(vec![SourceEvent {
            id,
            event_type: Some(EVENT_TYPE.to_string()),
            entity_id: location,
            timestamp: report.timestamp,
            data: Some(Value::Object(report.data)),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_report_becomes_one_event_keyed_by_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-api-key", "k-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "timestamp": "2024-01-15T10:30:00Z",
                "data": {
                    "temperature": 22.5,
                    "humidity": 65,
                    "conditions": "clear",
                    "location": "warehouse-01"
                }
            })))
            .mount(&server)
            .await;

        let adapter = WeatherAdapter::new(
            reqwest::Client::new(),
            server.uri(),
            Some("k-123".to_string()),
            Duration::from_secs(300),
        );
        let events = adapter.fetch_data().await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id.as_deref(), Some("warehouse-01"));
        assert_eq!(events[0].event_type.as_deref(), Some(EVENT_TYPE));
        assert_eq!(events[0].id.as_deref(), Some("warehouse-01@2024-01-15T10:30:00Z"));

        let envelope = event_bus::normalize(&events[0], adapter.source_system()).unwrap();
        assert_eq!(envelope.payload()["temperature"], json!(22.5));
    }

    #[tokio::test]
    async fn test_missing_location_yields_malformed_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "timestamp": "2024-01-15T10:30:00Z",
                "data": {"temperature": 22.5}
            })))
            .mount(&server)
            .await;

        let adapter =
            WeatherAdapter::new(reqwest::Client::new(), server.uri(), None, Duration::from_secs(300));
        let events = adapter.fetch_data().await.unwrap();

        assert!(event_bus::normalize(&events[0], SOURCE_SYSTEM).is_err());
    }
}
