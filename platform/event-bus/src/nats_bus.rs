//! NATS JetStream implementation of the EventBus trait

use crate::{AckHandle, BusError, BusMessage, BusResult, EventBus, PublishAck, KEY_HEADER};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Delay before re-opening a pull stream that failed
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// EventBus implementation using NATS JetStream
///
/// This is the production implementation. It wraps an `async_nats::Client`
/// connected once at startup; every publish waits for the JetStream `PubAck`
/// and every subscription is a durable pull consumer with explicit acks.
///
/// Each topic is backed by a stream named after it (see [`stream_name`]);
/// [`crate::jetstream_setup::ensure_streams`] creates them at startup.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// let ack = bus.publish("erp-events", "PROD-001", b"{}".to_vec()).await?;
/// assert!(ack.sequence > 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// JetStream stream backing a topic: `erp-events` → `ERP_EVENTS`
pub fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            '-' | '.' | '>' | '*' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> BusResult<PublishAck> {
        if subject.is_empty() {
            return Err(BusError::InvalidSubject("topic cannot be empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(format!("no broker confirmation: {}", e)))?;

        Ok(PublishAck {
            subject: subject.to_string(),
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        if durable_name.is_empty() {
            return Err(BusError::SubscribeError(
                "durable name cannot be empty".to_string(),
            ));
        }

        let stream = self
            .jetstream
            .get_stream(stream_name(subject))
            .await
            .map_err(|e| BusError::SubscribeError(format!("stream for {}: {}", subject, e)))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    filter_subject: subject.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let topic = subject.to_string();
        let stream = async_stream::stream! {
            loop {
                let mut messages = match consumer.messages().await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Failed to open pull stream, retrying");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(next) = messages.next().await {
                    match next {
                        Ok(message) => yield to_bus_message(message),
                        Err(e) => {
                            tracing::warn!(topic = %topic, error = %e, "Pull stream error, reopening");
                            break;
                        }
                    }
                }

                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        };

        Ok(stream.boxed())
    }
}

fn to_bus_message(message: jetstream::Message) -> BusMessage {
    let mut msg = BusMessage::new(message.subject.to_string(), message.payload.to_vec());

    if let Ok(info) = message.info() {
        msg = msg.with_sequence(info.stream_sequence);
    }

    if let Some(nats_headers) = &message.headers {
        let mut headers = HashMap::new();
        for (key, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(key) = headers.get(KEY_HEADER) {
            msg = msg.with_key(key.clone());
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg.with_ack_handle(Arc::new(NatsAck { message }))
}

struct NatsAck {
    message: jetstream::Message,
}

impl std::fmt::Debug for NatsAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsAck")
            .field("subject", &self.message.subject.as_str())
            .finish()
    }
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name() {
        assert_eq!(stream_name("erp-events"), "ERP_EVENTS");
        assert_eq!(stream_name("predictions-alerts"), "PREDICTIONS_ALERTS");
        assert_eq!(stream_name("dlq.erp-events"), "DLQ_ERP_EVENTS");
    }

    // Note: These tests require a running NATS server with JetStream enabled
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe_ack() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        crate::jetstream_setup::ensure_streams(&client, &["test-nats-events"])
            .await
            .unwrap();
        let bus = NatsBus::new(client);

        let ack = bus
            .publish("test-nats-events", "PROD-001", b"test message".to_vec())
            .await
            .unwrap();
        assert!(ack.sequence > 0);

        let mut stream = bus
            .subscribe("test-nats-events", "test-nats-consumer")
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test-nats-events");
        assert_eq!(msg.key.as_deref(), Some("PROD-001"));
        msg.ack().await.unwrap();
    }
}
