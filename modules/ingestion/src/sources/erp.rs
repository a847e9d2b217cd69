use super::http::get_json;
use super::{SourceAdapter, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use event_bus::SourceEvent;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

pub const SOURCE_SYSTEM: &str = "jde_erp";

/// The ERP answers with either a bare array or a wrapped list
///
/// Records stay untyped here; each one is read on its own so a single bad
/// record cannot fail the batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum ErpResponse {
    Events(Vec<Value>),
    Wrapped { events: Vec<Value> },
}

impl ErpResponse {
    fn into_events(self) -> Vec<SourceEvent> {
        match self {
            ErpResponse::Events(records) | ErpResponse::Wrapped { events: records } => {
                records.into_iter().map(read_record).collect()
            }
        }
    }
}

/// A record of the wrong shape keeps only its id, so normalization rejects
/// it as malformed and the supervisor counts it.
fn read_record(record: Value) -> SourceEvent {
    let id = record
        .get("id")
        .or_else(|| record.get("event_id"))
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    match serde_json::from_value::<SourceEvent>(record) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(
                source_system = SOURCE_SYSTEM,
                source_id = id.as_deref().unwrap_or("unknown"),
                error = %e,
                "ERP record has an unexpected shape"
            );
            SourceEvent {
                id,
                ..SourceEvent::default()
            }
        }
    }
}

/// Polls `GET {base_url}/events` on the ERP system of record
///
/// After every successful fetch the adapter remembers the newest event
/// timestamp it saw and sends it as `since` on the next request.
pub struct ErpAdapter {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
    since: Mutex<Option<DateTime<Utc>>>,
}

impl ErpAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        auth_token: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            poll_interval,
            since: Mutex::new(None),
        }
    }

    /// Current `since` watermark
    pub async fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.since.lock().await
    }
}

#[async_trait]
impl SourceAdapter for ErpAdapter {
    fn source_system(&self) -> &str {
        SOURCE_SYSTEM
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn fetch_data(&self) -> Result<Vec<SourceEvent>, SourceError> {
        // Held for the whole fetch so two overlapping polls cannot race the watermark.
        let mut since = self.since.lock().await;

        let mut request = self.client.get(format!("{}/events", self.base_url));
        if let Some(watermark) = *since {
            request = request.query(&[(
                "since",
                watermark.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )]);
        }
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let events = get_json::<ErpResponse>(request).await?.into_events();

        let newest = events
            .iter()
            .filter_map(|e| e.timestamp.as_deref())
            .filter_map(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .max();
        match (newest, *since) {
            (Some(newest), Some(current)) if newest <= current => {}
            (Some(newest), _) => *since = Some(newest),
            (None, _) => {}
        }

        tracing::debug!(
            source_system = SOURCE_SYSTEM,
            count = events.len(),
            "ERP events fetched"
        );
        Ok(events)
    }
}
