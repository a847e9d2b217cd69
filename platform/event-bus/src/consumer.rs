//! Typed, shutdown-aware consumer over a durable subscription
//!
//! Wraps the raw [`BusMessage`] stream of one topic and decodes every message
//! into an envelope type. Decoding failures are surfaced, not dropped, so the
//! caller can quarantine the message and still acknowledge it.

use crate::envelope::{Envelope, EnvelopeError};
use crate::shutdown::ShutdownSignal;
use crate::{BusMessage, BusResult, EventBus};
use futures::stream::{BoxStream, StreamExt};
use std::marker::PhantomData;

/// A delivered message together with its decoded envelope
#[derive(Debug)]
pub struct Delivery<E> {
    pub message: BusMessage,
    pub envelope: Result<E, EnvelopeError>,
}

impl<E> Delivery<E> {
    /// Acknowledge the underlying message so the durable position advances
    pub async fn ack(&self) -> BusResult<()> {
        self.message.ack().await
    }
}

pub struct EnvelopeConsumer<E> {
    topic: String,
    durable_name: String,
    stream: BoxStream<'static, BusMessage>,
    _envelope: PhantomData<fn() -> E>,
}

impl<E: Envelope> EnvelopeConsumer<E> {
    /// Open the durable subscription `durable_name` on `topic`
    pub async fn subscribe(bus: &dyn EventBus, topic: &str, durable_name: &str) -> BusResult<Self> {
        let stream = bus.subscribe(topic, durable_name).await?;
        tracing::info!(topic = %topic, consumer = %durable_name, "Subscribed");

        Ok(Self {
            topic: topic.to_string(),
            durable_name: durable_name.to_string(),
            stream,
            _envelope: PhantomData,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once shutdown is requested or the subscription ends.
    /// A pending shutdown wins over an available message.
    pub async fn next(&mut self, shutdown: &mut ShutdownSignal) -> Option<Delivery<E>> {
        if shutdown.is_triggered() {
            return None;
        }

        let message = tokio::select! {
            biased;
            _ = shutdown.triggered() => return None,
            message = self.stream.next() => message?,
        };

        let envelope = E::decode(&message.payload);
        Some(Delivery { message, envelope })
    }
}

impl<E> std::fmt::Debug for EnvelopeConsumer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeConsumer")
            .field("topic", &self.topic)
            .field("durable_name", &self.durable_name)
            .finish()
    }
}
