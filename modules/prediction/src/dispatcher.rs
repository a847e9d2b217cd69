//! Enrichment dispatcher
//!
//! Turns canonical envelopes into predictions:
//!
//! ```text
//! classify → pipeline? → features → complete? → score → publish
//!               │            │           │
//!               └── skip ────┴── skip ───┘
//! ```
//!
//! Every envelope is handled on its own; a failure never affects the next
//! one. The inbound message is acknowledged only once a prediction is
//! published or the envelope is known to need none. Transient collaborator
//! failures are retried in place and, when retries run out, the message is
//! left unacknowledged for the broker to deliver again.

use crate::classifier::{EntityClassifier, EntityType};
use crate::feature_store::{FeatureStore, FeatureStoreError};
use crate::metrics::Metrics;
use crate::pipeline::PipelineRegistry;
use crate::scoring::ScoringError;
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::dlq::quarantine;
use event_bus::{
    CanonicalEnvelope, Delivery, Envelope, EnvelopeConsumer, EnvelopeError, EnvelopePublisher,
    PredictionEnvelope, PublishError, ShutdownSignal,
};
use std::sync::Arc;
use tracing::Instrument;

/// Why an envelope was acknowledged without a prediction
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// No pipeline for the entity type
    NotActionable(EntityType),
    FeaturesNotFound,
    PartialFeatures { missing: Vec<String> },
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NotActionable(_) => "not_actionable",
            SkipReason::FeaturesNotFound => "features_not_found",
            SkipReason::PartialFeatures { .. } => "partial_features",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Published(PredictionEnvelope),
    Skipped(SkipReason),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("feature lookup failed: {0}")]
    FeatureStore(FeatureStoreError),

    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("prediction rejected: {0}")]
    InvalidPrediction(EnvelopeError),

    #[error("prediction publish failed: {0}")]
    Publish(PublishError),
}

impl DispatchError {
    /// Terminal errors would fail the same way on redelivery
    pub fn is_terminal(&self) -> bool {
        match self {
            DispatchError::FeatureStore(e) => !e.is_transient(),
            DispatchError::Scoring(_) | DispatchError::InvalidPrediction(_) => true,
            DispatchError::Publish(e) => !matches!(e, PublishError::PublishFailed(_)),
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            DispatchError::FeatureStore(_) => "feature_store",
            DispatchError::Scoring(_) | DispatchError::InvalidPrediction(_) => "scoring",
            DispatchError::Publish(_) => "publish",
        }
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Quarantined,
    LeftForRedelivery,
}

/// Dispositions counted by [`EnrichmentDispatcher::run`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: u64,
    pub quarantined: u64,
    pub left_for_redelivery: u64,
}

pub struct EnrichmentDispatcher {
    classifier: EntityClassifier,
    pipelines: PipelineRegistry,
    features: Arc<dyn FeatureStore>,
    publisher: EnvelopePublisher,
    output_topic: String,
    retry: RetryConfig,
    metrics: Metrics,
}

impl EnrichmentDispatcher {
    pub fn new(
        pipelines: PipelineRegistry,
        features: Arc<dyn FeatureStore>,
        publisher: EnvelopePublisher,
        output_topic: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            classifier: EntityClassifier::default(),
            pipelines,
            features,
            publisher,
            output_topic: output_topic.into(),
            retry: RetryConfig::default(),
            metrics,
        }
    }

    pub fn with_classifier(mut self, classifier: EntityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    /// Consume until shutdown. The delivery in hand is always finished.
    pub async fn run(
        &self,
        consumer: &mut EnvelopeConsumer<CanonicalEnvelope>,
        mut shutdown: ShutdownSignal,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        tracing::info!(
            topic = %consumer.topic(),
            consumer = %consumer.durable_name(),
            output_topic = %self.output_topic,
            "Dispatcher started"
        );

        while let Some(delivery) = consumer.next(&mut shutdown).await {
            match self.process(&delivery).await {
                Disposition::Acked => stats.acked += 1,
                Disposition::Quarantined => stats.quarantined += 1,
                Disposition::LeftForRedelivery => stats.left_for_redelivery += 1,
            }
        }

        tracing::info!(
            topic = %consumer.topic(),
            acked = stats.acked,
            quarantined = stats.quarantined,
            left_for_redelivery = stats.left_for_redelivery,
            "Dispatcher stopped"
        );
        stats
    }

    /// Handle one delivery and settle its acknowledgment
    pub async fn process(&self, delivery: &Delivery<CanonicalEnvelope>) -> Disposition {
        let topic = delivery.message.subject.as_str();
        let key = delivery.message.key.as_deref().unwrap_or_default();

        let envelope = match &delivery.envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(topic = %topic, key = %key, error = %e, "Undecodable inbound envelope");
                return self
                    .quarantine_and_ack(delivery, &e.to_string())
                    .await;
            }
        };

        let span = tracing::info_span!(
            "enrich",
            event_id = %envelope.event_id(),
            entity_id = %envelope.entity_id(),
            event_type = %envelope.event_type(),
        );

        async {
            match self.handle(envelope).await {
                Ok(DispatchOutcome::Published(prediction)) => {
                    self.metrics
                        .predictions_emitted_total
                        .with_label_values(&[prediction.prediction_type()])
                        .inc();
                    tracing::info!(
                        prediction_id = %prediction.prediction_id(),
                        prediction_type = %prediction.prediction_type(),
                        value = prediction.prediction_value(),
                        "Prediction published"
                    );
                    self.ack(delivery).await
                }
                Ok(DispatchOutcome::Skipped(reason)) => {
                    self.metrics
                        .predictions_skipped_total
                        .with_label_values(&[reason.label()])
                        .inc();
                    match &reason {
                        SkipReason::PartialFeatures { missing } => {
                            tracing::info!(missing = ?missing, "Incomplete features, skipping")
                        }
                        other => tracing::debug!(reason = other.label(), "No prediction needed"),
                    }
                    self.ack(delivery).await
                }
                Err(e) => {
                    self.metrics
                        .predictions_failed_total
                        .with_label_values(&[e.stage()])
                        .inc();
                    if e.is_terminal() {
                        tracing::error!(error = %e, "Enrichment failed permanently");
                        self.quarantine_and_ack(delivery, &e.to_string()).await
                    } else {
                        tracing::warn!(
                            error = %e,
                            "Enrichment failed, leaving message for redelivery"
                        );
                        Disposition::LeftForRedelivery
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Classify, enrich, score and publish one envelope
    pub async fn handle(&self, envelope: &CanonicalEnvelope) -> Result<DispatchOutcome, DispatchError> {
        let entity_type = self.classifier.classify(envelope.event_type());
        let Some(pipeline) = self.pipelines.get(entity_type) else {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotActionable(entity_type)));
        };

        let features = self.features.as_ref();
        let entity_id = envelope.entity_id();
        let names = pipeline.feature_names.as_slice();
        let lookup = retry_with_backoff(
            || features.get_features(entity_type, entity_id, names),
            &self.retry,
            "get_features",
            FeatureStoreError::is_transient,
        )
        .await;

        let values = match lookup {
            Ok(values) => values,
            Err(FeatureStoreError::NotFound { .. }) => {
                return Ok(DispatchOutcome::Skipped(SkipReason::FeaturesNotFound))
            }
            Err(e) => return Err(DispatchError::FeatureStore(e)),
        };

        let vector = match pipeline.feature_vector(&values) {
            Ok(vector) => vector,
            Err(missing) => {
                return Ok(DispatchOutcome::Skipped(SkipReason::PartialFeatures { missing }))
            }
        };

        let value = pipeline.model.predict(&vector)?;
        let prediction = PredictionEnvelope::for_source(
            envelope,
            entity_type.as_str(),
            pipeline.prediction_type.as_str(),
            value,
            pipeline.confidence,
            pipeline.model.model_version(),
        );
        prediction
            .validate()
            .map_err(DispatchError::InvalidPrediction)?;

        let publisher = &self.publisher;
        let topic = self.output_topic.as_str();
        let outgoing = &prediction;
        retry_with_backoff(
            || publisher.publish(topic, outgoing),
            &self.retry,
            "publish_prediction",
            |e| matches!(e, PublishError::PublishFailed(_)),
        )
        .await
        .map_err(DispatchError::Publish)?;

        Ok(DispatchOutcome::Published(prediction))
    }

    async fn ack(&self, delivery: &Delivery<CanonicalEnvelope>) -> Disposition {
        match delivery.ack().await {
            Ok(()) => Disposition::Acked,
            Err(e) => {
                tracing::warn!(
                    sequence = delivery.message.sequence,
                    error = %e,
                    "Ack failed, message will be redelivered"
                );
                Disposition::LeftForRedelivery
            }
        }
    }

    async fn quarantine_and_ack(&self, delivery: &Delivery<CanonicalEnvelope>, reason: &str) -> Disposition {
        let message = &delivery.message;
        let quarantined = quarantine(
            self.publisher.bus().as_ref(),
            &message.subject,
            message.key.as_deref().unwrap_or_default(),
            &message.payload,
            reason,
        )
        .await;
        if quarantined.is_none() {
            tracing::warn!(
                topic = %message.subject,
                "Quarantine failed, leaving message for redelivery"
            );
            return Disposition::LeftForRedelivery;
        }
        self.metrics
            .envelopes_quarantined_total
            .with_label_values(&[message.subject.as_str()])
            .inc();

        match self.ack(delivery).await {
            Disposition::Acked => Disposition::Quarantined,
            other => other,
        }
    }
}
