//! Poll loop supervisor
//!
//! Drives one [`SourceAdapter`] forever:
//!
//! ```text
//! Idle → Polling → SleepNominal ─┐
//!          ↑      ↘ SleepBackoff ┤
//!          └─────────────────────┘      (shutdown) → Stopped
//! ```
//!
//! A cycle first re-publishes anything left pending by an earlier broker
//! failure, then fetches, normalizes, validates and publishes the new batch
//! in source order. Each stage returns a typed result that decides between
//! the nominal interval and the fixed backoff; nothing in a cycle can end the
//! loop.

use crate::metrics::Metrics;
use crate::sources::{SourceAdapter, SourceError};
use event_bus::dlq::quarantine;
use event_bus::{
    normalize, BusError, CanonicalEnvelope, Envelope, EnvelopePublisher, PublishError,
    ShutdownSignal,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    SleepNominal,
    SleepBackoff,
    Stopped,
}

/// Observable state of one poll loop
#[derive(Debug, Clone, PartialEq)]
pub struct PollLoopState {
    pub phase: PollPhase,
    pub is_running: bool,
    pub consecutive_failures: u32,
    pub next_poll_at: Option<Instant>,
}

impl Default for PollLoopState {
    fn default() -> Self {
        Self {
            phase: PollPhase::Idle,
            is_running: false,
            consecutive_failures: 0,
            next_poll_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Topic every envelope of this source is published to
    pub topic: String,
    /// Fixed delay after a failed cycle
    pub backoff: Duration,
    /// Capacity of the pending buffer
    pub max_pending: usize,
}

/// Counts for one successful cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub malformed: usize,
    pub quarantined: usize,
}

/// Why a cycle went to backoff
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("publish failed with {pending} envelope(s) pending: {source}")]
    Publish { source: BusError, pending: usize },
}

impl CycleError {
    fn reason(&self) -> &'static str {
        match self {
            CycleError::Source(e) => e.reason(),
            CycleError::Publish { .. } => "publish_failed",
        }
    }
}

enum Sent {
    Published,
    Quarantined,
}

pub struct PollLoopSupervisor {
    adapter: Arc<dyn SourceAdapter>,
    publisher: EnvelopePublisher,
    settings: SupervisorSettings,
    metrics: Metrics,
    state: PollLoopState,
    pending: VecDeque<CanonicalEnvelope>,
    lost: u64,
}

impl PollLoopSupervisor {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        publisher: EnvelopePublisher,
        settings: SupervisorSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            adapter,
            publisher,
            settings,
            metrics,
            state: PollLoopState::default(),
            pending: VecDeque::new(),
            lost: 0,
        }
    }

    pub fn state(&self) -> &PollLoopState {
        &self.state
    }

    pub fn source_system(&self) -> &str {
        self.adapter.source_system()
    }

    /// Envelopes waiting to be re-published, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &CanonicalEnvelope> {
        self.pending.iter()
    }

    /// Envelopes evicted from the pending buffer so far
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Run until `shutdown` fires. A cycle in progress is always finished.
    pub async fn run(&mut self, mut shutdown: ShutdownSignal) {
        self.state.is_running = true;
        tracing::info!(
            source_system = %self.source_system(),
            topic = %self.settings.topic,
            "Poll loop started"
        );

        while !shutdown.is_triggered() {
            let delay = self.run_cycle().await;

            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.phase = PollPhase::Stopped;
        self.state.is_running = false;
        self.state.next_poll_at = None;
        tracing::info!(
            source_system = %self.source_system(),
            pending = self.pending.len(),
            "Poll loop stopped"
        );
    }

    /// Run one cycle and return how long to sleep before the next one.
    ///
    /// Success resets the failure streak and yields the adapter's nominal
    /// interval; any failure extends the streak and yields the fixed backoff.
    pub async fn run_cycle(&mut self) -> Duration {
        self.state.phase = PollPhase::Polling;
        let source_system = self.source_system().to_string();
        let span = tracing::info_span!("poll_cycle", source_system = %source_system);

        let delay = match self.poll_cycle().instrument(span).await {
            Ok(report) => {
                self.state.consecutive_failures = 0;
                self.state.phase = PollPhase::SleepNominal;
                tracing::info!(
                    source_system = %source_system,
                    fetched = report.fetched,
                    published = report.published,
                    malformed = report.malformed,
                    quarantined = report.quarantined,
                    "Poll cycle completed"
                );
                self.adapter.poll_interval()
            }
            Err(e) => {
                self.state.consecutive_failures += 1;
                self.state.phase = PollPhase::SleepBackoff;
                self.metrics
                    .poll_failures_total
                    .with_label_values(&[source_system.as_str(), e.reason()])
                    .inc();
                if let CycleError::Source(SourceError::RateLimited {
                    retry_after: Some(retry_after),
                }) = &e
                {
                    tracing::debug!(
                        source_system = %source_system,
                        retry_after_secs = retry_after.as_secs(),
                        "Source asked for a longer pause; keeping fixed backoff"
                    );
                }
                tracing::warn!(
                    source_system = %source_system,
                    consecutive_failures = self.state.consecutive_failures,
                    backoff_secs = self.settings.backoff.as_secs(),
                    error = %e,
                    "Poll cycle failed"
                );
                self.settings.backoff
            }
        };

        self.metrics
            .consecutive_failures
            .with_label_values(&[source_system.as_str()])
            .set(i64::from(self.state.consecutive_failures));
        self.metrics
            .pending_envelopes
            .with_label_values(&[source_system.as_str()])
            .set(self.pending.len() as i64);
        self.state.next_poll_at = Some(Instant::now() + delay);
        delay
    }

    /// One pass: flush pending, fetch, normalize, validate, publish.
    pub async fn poll_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();

        while let Some(envelope) = self.pending.pop_front() {
            match self.send(&envelope).await {
                Ok(Sent::Published) => report.published += 1,
                Ok(Sent::Quarantined) => report.quarantined += 1,
                Err(source) => {
                    self.pending.push_front(envelope);
                    return Err(CycleError::Publish {
                        source,
                        pending: self.pending.len(),
                    });
                }
            }
        }

        let events = self.adapter.fetch_data().await?;
        report.fetched = events.len();

        let source_system = self.source_system().to_string();
        let mut batch = VecDeque::with_capacity(events.len());
        for event in &events {
            match normalize(event, &source_system) {
                Ok(envelope) => batch.push_back(envelope),
                Err(e) => {
                    report.malformed += 1;
                    self.metrics
                        .events_malformed_total
                        .with_label_values(&[source_system.as_str()])
                        .inc();
                    tracing::warn!(
                        source_system = %source_system,
                        source_id = event.id.as_deref().unwrap_or("unknown"),
                        error = %e,
                        "Dropping malformed source event"
                    );
                }
            }
        }

        while let Some(envelope) = batch.pop_front() {
            match self.send(&envelope).await {
                Ok(Sent::Published) => report.published += 1,
                Ok(Sent::Quarantined) => report.quarantined += 1,
                Err(source) => {
                    self.retain(envelope);
                    for rest in batch {
                        self.retain(rest);
                    }
                    return Err(CycleError::Publish {
                        source,
                        pending: self.pending.len(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Validate and publish one envelope.
    ///
    /// Invalid envelopes are quarantined and count as handled. A broker
    /// failure, on the topic or on the quarantine subject, is returned as an
    /// error.
    async fn send(&self, envelope: &CanonicalEnvelope) -> Result<Sent, BusError> {
        let source_system = self.source_system();

        let rejection = match envelope.validate() {
            Err(e) => e.to_string(),
            Ok(()) => match self.publisher.publish(&self.settings.topic, envelope).await {
                Ok(ack) => {
                    self.metrics
                        .events_published_total
                        .with_label_values(&[source_system])
                        .inc();
                    tracing::debug!(
                        source_system = %source_system,
                        event_id = %envelope.event_id(),
                        entity_id = %envelope.entity_id(),
                        sequence = ack.sequence,
                        "Envelope published"
                    );
                    return Ok(Sent::Published);
                }
                Err(PublishError::PublishFailed(e)) => return Err(e),
                Err(e) => e.to_string(),
            },
        };

        tracing::error!(
            source_system = %source_system,
            event_id = %envelope.event_id(),
            entity_id = %envelope.entity_id(),
            reason = %rejection,
            "Invalid envelope, quarantining"
        );
        let payload = serde_json::to_vec(envelope).unwrap_or_default();
        let quarantined = quarantine(
            self.publisher.bus().as_ref(),
            &self.settings.topic,
            envelope.entity_id(),
            &payload,
            &rejection,
        )
        .await;
        if quarantined.is_none() {
            // Kept like any other unpublished envelope until the DLQ accepts it
            return Err(BusError::PublishError(format!(
                "quarantine of event {} failed",
                envelope.event_id()
            )));
        }
        self.metrics
            .envelopes_quarantined_total
            .with_label_values(&[source_system])
            .inc();
        Ok(Sent::Quarantined)
    }

    /// Keep an envelope for the next cycle, evicting the oldest when full
    fn retain(&mut self, envelope: CanonicalEnvelope) {
        if self.settings.max_pending == 0 {
            self.record_lost(&envelope);
            return;
        }
        if self.pending.len() >= self.settings.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                self.record_lost(&evicted);
            }
        }
        self.pending.push_back(envelope);
    }

    fn record_lost(&mut self, envelope: &CanonicalEnvelope) {
        self.lost += 1;
        self.metrics
            .envelopes_lost_total
            .with_label_values(&[self.adapter.source_system()])
            .inc();
        tracing::error!(
            source_system = %self.adapter.source_system(),
            event_id = %envelope.event_id(),
            entity_id = %envelope.entity_id(),
            lost_total = self.lost,
            "Pending buffer full, envelope lost"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use event_bus::{BusMessage, BusResult, EventBus, InMemoryBus, PublishAck, SourceEvent};
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Adapter returning scripted results, then empty batches
    struct ScriptedAdapter {
        script: Mutex<VecDeque<Result<Vec<SourceEvent>, SourceError>>>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<Vec<SourceEvent>, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_system(&self) -> &str {
            "jde_erp"
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn fetch_data(&self) -> Result<Vec<SourceEvent>, SourceError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// In-memory bus whose publishes can be switched off
    #[derive(Clone, Default)]
    struct FlakyBus {
        inner: InMemoryBus,
        down: Arc<AtomicBool>,
        dlq_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> BusResult<PublishAck> {
            let dlq = subject.starts_with("dlq.");
            if self.down.load(Ordering::SeqCst) || (dlq && self.dlq_down.load(Ordering::SeqCst)) {
                return Err(BusError::PublishError("broker unreachable".to_string()));
            }
            self.inner.publish(subject, key, payload).await
        }

        async fn subscribe(
            &self,
            subject: &str,
            durable_name: &str,
        ) -> BusResult<BoxStream<'static, BusMessage>> {
            self.inner.subscribe(subject, durable_name).await
        }
    }

    fn event(id: &str, entity_id: &str) -> SourceEvent {
        SourceEvent::new(
            id,
            "INVENTORY_UPDATED",
            entity_id,
            "2024-01-15T10:35:00Z",
            json!({"warehouse": "WH-01"}),
        )
    }

    fn supervisor(
        adapter: Arc<ScriptedAdapter>,
        bus: Arc<dyn EventBus>,
        max_pending: usize,
    ) -> PollLoopSupervisor {
        PollLoopSupervisor::new(
            adapter,
            EnvelopePublisher::new(bus),
            SupervisorSettings {
                topic: "erp-events".to_string(),
                backoff: Duration::from_secs(10),
                max_pending,
            },
            Metrics::new().unwrap(),
        )
    }

    async fn published_keys(bus: &InMemoryBus) -> Vec<String> {
        bus.published("erp-events")
            .await
            .into_iter()
            .filter_map(|m| m.key)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_cycle_publishes_batch() {
        let bus = InMemoryBus::new();
        let adapter = ScriptedAdapter::new(vec![Ok(vec![event("e1", "PROD-001"), event("e2", "PROD-002")])]);
        let mut sup = supervisor(adapter, Arc::new(bus.clone()), 10);

        let delay = sup.run_cycle().await;

        assert_eq!(delay, Duration::from_secs(60));
        assert_eq!(sup.state().phase, PollPhase::SleepNominal);
        assert_eq!(sup.state().consecutive_failures, 0);
        assert!(sup.state().next_poll_at.is_some());
        assert_eq!(published_keys(&bus).await, vec!["PROD-001", "PROD-002"]);
    }

    #[tokio::test]
    async fn test_backoff_after_failures_then_nominal() {
        let bus = InMemoryBus::new();
        let adapter = ScriptedAdapter::new(vec![
            Err(SourceError::ServiceUnavailable("down".into())),
            Err(SourceError::RateLimited { retry_after: Some(Duration::from_secs(120)) }),
            Err(SourceError::InvalidResponse("bad json".into())),
            Ok(vec![event("e1", "PROD-001")]),
        ]);
        let mut sup = supervisor(adapter, Arc::new(bus.clone()), 10);

        for k in 1..=3 {
            assert_eq!(sup.run_cycle().await, Duration::from_secs(10));
            assert_eq!(sup.state().consecutive_failures, k);
            assert_eq!(sup.state().phase, PollPhase::SleepBackoff);
        }

        assert_eq!(sup.run_cycle().await, Duration::from_secs(60));
        assert_eq!(sup.state().consecutive_failures, 0);
        assert_eq!(bus.published("erp-events").await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_contained() {
        let bus = InMemoryBus::new();
        let mut broken = event("e2", "PROD-002");
        broken.timestamp = Some("not a time".to_string());
        let adapter = ScriptedAdapter::new(vec![Ok(vec![
            event("e1", "PROD-001"),
            broken,
            event("e3", "PROD-003"),
        ])]);
        let mut sup = supervisor(adapter, Arc::new(bus.clone()), 10);

        let report = sup.poll_cycle().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.published, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(published_keys(&bus).await, vec!["PROD-001", "PROD-003"]);
    }

    #[tokio::test]
    async fn test_publish_failure_retains_batch_in_order() {
        let flaky = FlakyBus::default();
        let adapter = ScriptedAdapter::new(vec![
            Ok(vec![event("e1", "PROD-001"), event("e2", "PROD-001")]),
            Ok(vec![event("e3", "PROD-001")]),
        ]);
        let mut sup = supervisor(adapter, Arc::new(flaky.clone()), 10);

        flaky.down.store(true, Ordering::SeqCst);
        assert_eq!(sup.run_cycle().await, Duration::from_secs(10));
        assert_eq!(sup.pending().count(), 2);
        assert!(flaky.inner.published("erp-events").await.is_empty());

        flaky.down.store(false, Ordering::SeqCst);
        assert_eq!(sup.run_cycle().await, Duration::from_secs(60));
        assert_eq!(sup.pending().count(), 0);

        let stored = flaky.inner.published("erp-events").await;
        let ids: Vec<String> = stored
            .iter()
            .map(|m| CanonicalEnvelope::decode(&m.payload).unwrap().event_id().to_string())
            .collect();
        let expected: Vec<String> = ["e1", "e2", "e3"]
            .iter()
            .map(|id| normalize(&event(id, "PROD-001"), "jde_erp").unwrap().event_id().to_string())
            .collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_pending_overflow_counts_lost() {
        let flaky = FlakyBus::default();
        flaky.down.store(true, Ordering::SeqCst);
        let adapter = ScriptedAdapter::new(vec![Ok(vec![
            event("e1", "PROD-001"),
            event("e2", "PROD-002"),
            event("e3", "PROD-003"),
        ])]);
        let mut sup = supervisor(adapter, Arc::new(flaky.clone()), 2);

        let err = sup.poll_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Publish { pending: 2, .. }));
        assert_eq!(sup.lost(), 1);

        let kept: Vec<&str> = sup.pending().map(|e| e.entity_id()).collect();
        assert_eq!(kept, vec!["PROD-002", "PROD-003"]);
    }

    #[tokio::test]
    async fn test_pending_flush_failure_skips_fetch() {
        let flaky = FlakyBus::default();
        let adapter = ScriptedAdapter::new(vec![
            Ok(vec![event("e1", "PROD-001")]),
            Ok(vec![event("e2", "PROD-002")]),
        ]);
        let mut sup = supervisor(adapter.clone(), Arc::new(flaky.clone()), 10);

        flaky.down.store(true, Ordering::SeqCst);
        assert!(sup.poll_cycle().await.is_err());
        assert!(sup.poll_cycle().await.is_err());

        // The second batch was never fetched while the broker was down
        assert_eq!(adapter.script.lock().unwrap().len(), 1);
        assert_eq!(sup.pending().count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_quarantined() {
        let bus = InMemoryBus::new();
        let adapter = ScriptedAdapter::new(vec![Ok(vec![event("e1", "PROD-001")])]);
        let mut sup = PollLoopSupervisor::new(
            adapter,
            EnvelopePublisher::new(Arc::new(bus.clone())),
            SupervisorSettings {
                topic: "erp-events".to_string(),
                backoff: Duration::from_secs(10),
                max_pending: 10,
            },
            Metrics::new().unwrap(),
        );

        let invalid = CanonicalEnvelope::new(
            String::new(),
            "INVENTORY_UPDATED".to_string(),
            "PROD-009".to_string(),
            chrono::Utc::now(),
            serde_json::Map::new(),
            "jde_erp".to_string(),
        );
        sup.retain(invalid);

        let report = sup.poll_cycle().await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.published, 1);
        assert_eq!(bus.published("dlq.erp-events").await.len(), 1);
        assert_eq!(bus.published("erp-events").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_quarantine_keeps_envelope_pending() {
        let flaky = FlakyBus::default();
        flaky.dlq_down.store(true, Ordering::SeqCst);
        let adapter = ScriptedAdapter::new(vec![]);
        let metrics = Metrics::new().unwrap();
        let mut sup = PollLoopSupervisor::new(
            adapter,
            EnvelopePublisher::new(Arc::new(flaky.clone())),
            SupervisorSettings {
                topic: "erp-events".to_string(),
                backoff: Duration::from_secs(10),
                max_pending: 10,
            },
            metrics.clone(),
        );

        let invalid = CanonicalEnvelope::new(
            String::new(),
            "INVENTORY_UPDATED".to_string(),
            "PROD-009".to_string(),
            chrono::Utc::now(),
            serde_json::Map::new(),
            "jde_erp".to_string(),
        );
        sup.retain(invalid);

        let err = sup.poll_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Publish { pending: 1, .. }));
        assert_eq!(sup.pending().count(), 1);
        assert_eq!(
            metrics
                .envelopes_quarantined_total
                .with_label_values(&["jde_erp"])
                .get(),
            0
        );

        // Once the DLQ is reachable the envelope is quarantined on the next cycle
        flaky.dlq_down.store(false, Ordering::SeqCst);
        let report = sup.poll_cycle().await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(sup.pending().count(), 0);
        assert_eq!(flaky.inner.published("dlq.erp-events").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let bus = InMemoryBus::new();
        let adapter = ScriptedAdapter::new(vec![
            Err(SourceError::ServiceUnavailable("down".into())),
            Ok(vec![event("e1", "PROD-001")]),
        ]);
        let mut sup = supervisor(adapter, Arc::new(bus.clone()), 10);
        let (trigger, shutdown) = event_bus::shutdown_channel();

        let handle = tokio::spawn(async move {
            sup.run(shutdown).await;
            sup
        });

        // Backoff (10s) then one nominal cycle
        tokio::time::sleep(Duration::from_secs(15)).await;
        trigger.trigger();

        let sup = handle.await.unwrap();
        assert_eq!(sup.state().phase, PollPhase::Stopped);
        assert!(!sup.state().is_running);
        assert_eq!(bus.published("erp-events").await.len(), 1);
    }
}
