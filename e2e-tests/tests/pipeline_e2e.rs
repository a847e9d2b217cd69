//! ERP poll → canonical envelope → enrichment → prediction, in one process
//!
//! Both services share an in-memory bus; the ERP is a wiremock server and the
//! model a constant, so the expected prediction is exact.

use chrono::{DateTime, Utc};
use event_bus::{
    shutdown_channel, CanonicalEnvelope, Envelope, EnvelopeConsumer, EnvelopePublisher,
    InMemoryBus, PredictionEnvelope,
};
use ingestion::metrics::Metrics as IngestionMetrics;
use ingestion::sources::ErpAdapter;
use ingestion::supervisor::{PollLoopSupervisor, SupervisorSettings};
use prediction::classifier::EntityType;
use prediction::dispatcher::EnrichmentDispatcher;
use prediction::feature_store::InMemoryFeatureStore;
use prediction::metrics::Metrics as PredictionMetrics;
use prediction::pipeline::PipelineRegistry;
use prediction::scoring::{ScoringError, ScoringFunction};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct DemandStub;

impl ScoringFunction for DemandStub {
    fn predict(&self, features: &[f64]) -> Result<f64, ScoringError> {
        assert_eq!(features, &[12.0, 48.0, 20.0, 0.0, 1.0][..]);
        Ok(13.2)
    }

    fn model_version(&self) -> &str {
        "demand-stub-1"
    }
}

async fn erp_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": "e1",
            "type": "INVENTORY_UPDATED",
            "entity_id": "PROD-001",
            "timestamp": "2024-01-15T10:35:00Z",
            "data": {"warehouse": "WH-01", "new_quantity": 48}
        }])))
        .mount(&server)
        .await;
    server
}

fn feature_store() -> InMemoryFeatureStore {
    let store = InMemoryFeatureStore::new();
    store.insert(
        EntityType::Product,
        "PROD-001",
        [
            ("historical_demand_7d", 12.0),
            ("historical_demand_30d", 48.0),
            ("price", 20.0),
            ("day_of_week", 0.0),
            ("month", 1.0),
        ],
    );
    store
}

async fn wait_for_commits(bus: &InMemoryBus, count: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bus.committed("erp-events", "prediction-service").await < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "prediction service did not acknowledge {} envelope(s)",
            count
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_inventory_update_becomes_demand_forecast() {
    let erp = erp_server().await;
    let bus = InMemoryBus::new();
    let publisher = EnvelopePublisher::new(Arc::new(bus.clone()));

    let mut supervisor = PollLoopSupervisor::new(
        Arc::new(ErpAdapter::new(
            reqwest::Client::new(),
            erp.uri(),
            None,
            Duration::from_secs(60),
        )),
        publisher.clone(),
        SupervisorSettings {
            topic: "erp-events".to_string(),
            backoff: Duration::from_secs(10),
            max_pending: 100,
        },
        IngestionMetrics::new().unwrap(),
    );

    let dispatcher = EnrichmentDispatcher::new(
        PipelineRegistry::with_default(Arc::new(DemandStub), 0.85).unwrap(),
        Arc::new(feature_store()),
        publisher,
        "predictions-alerts",
        PredictionMetrics::new().unwrap(),
    );
    let consumer = EnvelopeConsumer::<CanonicalEnvelope>::subscribe(&bus, "erp-events", "prediction-service")
        .await
        .unwrap();
    let (trigger, shutdown) = shutdown_channel();
    let handle = prediction::spawn_dispatcher(Arc::new(dispatcher), consumer, shutdown);

    // The ERP keeps returning the same event, so the second cycle is a duplicate
    assert_eq!(supervisor.run_cycle().await, Duration::from_secs(60));
    wait_for_commits(&bus, 1).await;
    assert_eq!(supervisor.run_cycle().await, Duration::from_secs(60));
    wait_for_commits(&bus, 2).await;

    trigger.trigger();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    assert_eq!(stats.acked, 2);

    let envelopes = bus.published("erp-events").await;
    let canonical = CanonicalEnvelope::decode(&envelopes[0].payload).unwrap();
    assert_eq!(canonical.source_system(), "jde_erp");
    assert_eq!(canonical.entity_id(), "PROD-001");
    let event_time: DateTime<Utc> = "2024-01-15T10:35:00Z".parse().unwrap();
    assert_eq!(canonical.timestamp(), event_time);

    let predictions: Vec<PredictionEnvelope> = bus
        .published("predictions-alerts")
        .await
        .iter()
        .map(|m| PredictionEnvelope::decode(&m.payload).unwrap())
        .collect();
    assert_eq!(predictions.len(), 2);

    let first = &predictions[0];
    assert_eq!(first.entity_type(), "product");
    assert_eq!(first.entity_id(), "PROD-001");
    assert_eq!(first.prediction_type(), "demand_forecast");
    assert_eq!(first.prediction_value(), 13.2);
    assert_eq!(first.confidence(), 0.85);
    assert_eq!(first.model_version(), "demand-stub-1");
    assert_eq!(first.timestamp(), event_time);
    assert_eq!(first.prediction_id(), "pred_PROD-001_2024-01-15T10:35:00Z");

    // Reprocessing the same input is idempotent by id
    assert_eq!(predictions[0].prediction_id(), predictions[1].prediction_id());
}
