//! # EventBus Abstraction
//!
//! The publish/consume boundary of the ingestion → prediction pipeline.
//!
//! Every execution unit (one poll loop per source adapter, one dispatcher per
//! consumer) talks to the others only through topics on this bus, never through
//! shared in-memory state.
//!
//! ## Guarantees
//!
//! - `publish` is keyed: for a fixed `(topic, key)` pair, messages are delivered
//!   in the order `publish` was called. Nothing is promised across keys.
//! - `publish` returns only once the broker has acknowledged durability.
//! - `subscribe` is durable and named: a message that was delivered but never
//!   acknowledged is delivered again (at-least-once).
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation backed by per-topic logs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus, NatsBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn EventBus> = Arc::new(NatsBus::new(nats_client));
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let ack = bus.publish("erp-events", "PROD-001", b"{}".to_vec()).await?;
//! println!("stored at sequence {}", ack.sequence);
//!
//! let mut stream = bus.subscribe("erp-events", "prediction-service").await?;
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//!     msg.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod consumer_retry;
pub mod dlq;
mod envelope;
mod inmemory_bus;
pub mod jetstream_setup;
mod nats_bus;
pub mod publisher;
pub mod shutdown;

pub use consumer::{Delivery, EnvelopeConsumer};
pub use envelope::{
    normalize, CanonicalEnvelope, Envelope, EnvelopeError, PredictionEnvelope, SourceEvent,
    SCHEMA_VERSION,
};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use publisher::{EnvelopePublisher, PublishError};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Header carrying the partition key of a published message.
pub const KEY_HEADER: &str = "Pipeline-Key";

/// Broker-side acknowledgment handle attached to a delivered message.
#[async_trait]
pub trait AckHandle: Send + Sync + fmt::Debug {
    /// Mark the message as processed so the consumer's position can advance.
    async fn ack(&self) -> BusResult<()>;
}

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The topic this message was published to
    pub subject: String,
    /// Partition key given at publish time
    pub key: Option<String>,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Position of the message within its topic (1-based)
    pub sequence: u64,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
    ack_handle: Option<Arc<dyn AckHandle>>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            key: None,
            payload,
            sequence: 0,
            headers: None,
            ack_handle: None,
        }
    }

    pub fn with_key(mut self, key: String) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Attach the handle used by [`BusMessage::ack`]
    pub fn with_ack_handle(mut self, handle: Arc<dyn AckHandle>) -> Self {
        self.ack_handle = Some(handle);
        self
    }

    /// Acknowledge successful processing.
    ///
    /// Messages built without an ack handle (e.g. in unit tests) ack trivially.
    pub async fn ack(&self) -> BusResult<()> {
        match &self.ack_handle {
            Some(handle) => handle.ack().await,
            None => Ok(()),
        }
    }
}

/// Broker confirmation returned by [`EventBus::publish`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Topic the message was stored in
    pub subject: String,
    /// Position assigned by the broker
    pub sequence: u64,
    /// The broker recognised the message as a duplicate
    pub duplicate: bool,
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for keyed, acknowledged messaging
///
/// Implementations must be safe for concurrent use by every task holding the
/// shared `Arc<dyn EventBus>`; connection setup happens once, at construction.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic under a partition key
    ///
    /// # Arguments
    /// * `subject` - The topic to publish to (e.g., "erp-events")
    /// * `key` - Partition key; ordering is guaranteed per `(subject, key)`
    /// * `payload` - The message payload as raw bytes
    ///
    /// # Returns
    /// * `Ok(PublishAck)` once the broker has stored the message
    /// * `Err(BusError)` if the broker rejected it or could not confirm
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> BusResult<PublishAck>;

    /// Open a durable, named subscription to a topic
    ///
    /// Delivery resumes after the last acknowledged message of `durable_name`,
    /// so anything delivered but not acknowledged before a restart is
    /// delivered again.
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_without_handle_is_noop() {
        let msg = BusMessage::new("erp-events".to_string(), b"{}".to_vec())
            .with_key("PROD-001".to_string())
            .with_sequence(7);

        assert_eq!(msg.key.as_deref(), Some("PROD-001"));
        assert_eq!(msg.sequence, 7);
        assert!(msg.ack().await.is_ok());
    }
}
