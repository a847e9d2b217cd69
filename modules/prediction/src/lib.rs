//! Prediction service
//!
//! Consumes canonical envelopes from a durable subscription, enriches them
//! from the feature store, scores them with a shared model and publishes the
//! resulting predictions.

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod feature_store;
pub mod metrics;
pub mod pipeline;
pub mod scoring;

use dispatcher::{DispatchStats, EnrichmentDispatcher};
use event_bus::{CanonicalEnvelope, EnvelopeConsumer, ShutdownSignal};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Run one dispatcher over `consumer` on its own task until shutdown
pub fn spawn_dispatcher(
    dispatcher: Arc<EnrichmentDispatcher>,
    mut consumer: EnvelopeConsumer<CanonicalEnvelope>,
    shutdown: ShutdownSignal,
) -> JoinHandle<DispatchStats> {
    tokio::spawn(async move { dispatcher.run(&mut consumer, shutdown).await })
}
