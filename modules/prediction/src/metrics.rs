use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub predictions_emitted_total: IntCounterVec,
    pub predictions_skipped_total: IntCounterVec,
    pub predictions_failed_total: IntCounterVec,
    pub envelopes_quarantined_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let predictions_emitted_total = IntCounterVec::new(
            Opts::new("prediction_emitted_total", "Predictions acknowledged by the broker"),
            &["prediction_type"],
        )?;
        let predictions_skipped_total = IntCounterVec::new(
            Opts::new("prediction_skipped_total", "Envelopes acked without a prediction"),
            &["reason"], // not_actionable|features_not_found|partial_features
        )?;
        let predictions_failed_total = IntCounterVec::new(
            Opts::new("prediction_failed_total", "Envelopes whose enrichment failed"),
            &["stage"], // feature_store|scoring|publish
        )?;
        let envelopes_quarantined_total = IntCounterVec::new(
            Opts::new("prediction_envelopes_quarantined_total", "Inbound envelopes sent to the DLQ"),
            &["topic"],
        )?;

        registry.register(Box::new(predictions_emitted_total.clone()))?;
        registry.register(Box::new(predictions_skipped_total.clone()))?;
        registry.register(Box::new(predictions_failed_total.clone()))?;
        registry.register(Box::new(envelopes_quarantined_total.clone()))?;

        Ok(Self {
            registry,
            predictions_emitted_total,
            predictions_skipped_total,
            predictions_failed_total,
            envelopes_quarantined_total,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
