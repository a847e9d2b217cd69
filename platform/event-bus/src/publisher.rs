//! Envelope publisher
//!
//! Validates and serializes an envelope, then publishes it under its key and
//! waits for the broker's acknowledgment.

use crate::envelope::{Envelope, EnvelopeError};
use crate::{BusError, EventBus, PublishAck};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("failed to serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    PublishFailed(#[from] BusError),
}

/// Keyed publisher over a shared bus connection
#[derive(Debug, Clone)]
pub struct EnvelopePublisher {
    bus: Arc<dyn EventBus>,
}

impl EnvelopePublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Publish `envelope` to `topic`, keyed by [`Envelope::key`].
    ///
    /// Validation runs first; an invalid envelope never reaches the broker.
    /// Returns once the broker has confirmed the write.
    pub async fn publish<E: Envelope>(
        &self,
        topic: &str,
        envelope: &E,
    ) -> Result<PublishAck, PublishError> {
        envelope.validate()?;
        let payload = serde_json::to_vec(envelope)?;
        let ack = self.bus.publish(topic, envelope.key(), payload).await?;

        tracing::debug!(
            topic = %topic,
            key = %envelope.key(),
            sequence = ack.sequence,
            "Envelope published"
        );
        Ok(ack)
    }
}
