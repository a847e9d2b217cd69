use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Ingestion counters, labelled by `source_system`
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub events_published_total: IntCounterVec,
    pub events_malformed_total: IntCounterVec,
    pub envelopes_quarantined_total: IntCounterVec,
    pub envelopes_lost_total: IntCounterVec,
    pub poll_failures_total: IntCounterVec,

    // Gauges
    pub pending_envelopes: IntGaugeVec,
    pub consecutive_failures: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_published_total = IntCounterVec::new(
            Opts::new("ingestion_events_published_total", "Envelopes acknowledged by the broker"),
            &["source_system"],
        )?;
        let events_malformed_total = IntCounterVec::new(
            Opts::new("ingestion_events_malformed_total", "Source events dropped at normalization"),
            &["source_system"],
        )?;
        let envelopes_quarantined_total = IntCounterVec::new(
            Opts::new("ingestion_envelopes_quarantined_total", "Envelopes sent to the DLQ"),
            &["source_system"],
        )?;
        let envelopes_lost_total = IntCounterVec::new(
            Opts::new(
                "ingestion_envelopes_lost_total",
                "Envelopes evicted from a full pending buffer",
            ),
            &["source_system"],
        )?;
        let poll_failures_total = IntCounterVec::new(
            Opts::new("ingestion_poll_failures_total", "Failed poll cycles"),
            &["source_system", "reason"], // service_unavailable|rate_limited|invalid_response|publish_failed
        )?;
        let pending_envelopes = IntGaugeVec::new(
            Opts::new("ingestion_pending_envelopes", "Envelopes awaiting re-publish"),
            &["source_system"],
        )?;
        let consecutive_failures = IntGaugeVec::new(
            Opts::new("ingestion_consecutive_failures", "Failed poll cycles in a row"),
            &["source_system"],
        )?;

        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_malformed_total.clone()))?;
        registry.register(Box::new(envelopes_quarantined_total.clone()))?;
        registry.register(Box::new(envelopes_lost_total.clone()))?;
        registry.register(Box::new(poll_failures_total.clone()))?;
        registry.register(Box::new(pending_envelopes.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        Ok(Self {
            registry,
            events_published_total,
            events_malformed_total,
            envelopes_quarantined_total,
            envelopes_lost_total,
            poll_failures_total,
            pending_envelopes,
            consecutive_failures,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics
            .events_published_total
            .with_label_values(&["jde_erp"])
            .inc_by(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("ingestion_events_published_total{source_system=\"jde_erp\"} 3"));
    }
}
