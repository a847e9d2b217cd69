//! JetStream stream provisioning for pipeline topics

use crate::dlq::DLQ_PREFIX;
use crate::nats_bus::stream_name;
use async_nats::jetstream::{self, stream::Config};
use async_nats::Client;
use std::time::Duration;

/// Stream collecting every quarantined message
pub const DLQ_STREAM: &str = "PIPELINE_DLQ";

/// Create one stream per topic, plus the quarantine stream, when missing
pub async fn ensure_streams(
    nats: &Client,
    topics: &[&str],
) -> Result<(), async_nats::Error> {
    let js = jetstream::new(nats.clone());

    for topic in topics {
        let name = stream_name(topic);
        if js.get_stream(&name).await.is_err() {
            js.create_stream(Config {
                name: name.clone(),
                subjects: vec![topic.to_string()],
                max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
                ..Default::default()
            })
            .await?;
            tracing::info!(topic = %topic, stream = %name, "Created JetStream stream");
        }
    }

    if js.get_stream(DLQ_STREAM).await.is_err() {
        js.create_stream(Config {
            name: DLQ_STREAM.to_string(),
            subjects: vec![format!("{}.>", DLQ_PREFIX)],
            max_age: Duration::from_secs(60 * 60 * 24 * 30), // 30 days
            ..Default::default()
        })
        .await?;
        tracing::info!(stream = DLQ_STREAM, "Created JetStream stream");
    }

    Ok(())
}
