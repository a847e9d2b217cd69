use anyhow::Context;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{
    shutdown_channel, CanonicalEnvelope, EnvelopeConsumer, EnvelopePublisher, EventBus,
    InMemoryBus, NatsBus,
};
use prediction::config::{BusType, Config, FeatureStoreType};
use prediction::dispatcher::EnrichmentDispatcher;
use prediction::feature_store::{FeastFeatureStore, FeatureStore, InMemoryFeatureStore};
use prediction::metrics::Metrics;
use prediction::pipeline::PipelineRegistry;
use prediction::scoring::{LinearModel, ScoringFunction};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!(
        bus_type = ?config.bus_type,
        input_topic = %config.input_topic,
        output_topic = %config.output_topic,
        consumer = %config.consumer_name,
        "Configuration loaded"
    );

    let model = LinearModel::load(&config.model_artifact)
        .with_context(|| format!("Failed to load model {}", config.model_artifact.display()))?;
    tracing::info!(
        model = %model.name(),
        model_version = %model.model_version(),
        "Model loaded"
    );
    let model: Arc<dyn ScoringFunction> = Arc::new(model);
    let pipelines = PipelineRegistry::with_default(model, config.confidence)
        .context("Model does not fit the demand forecast pipeline")?;

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::Nats => {
            let nats_url = config
                .nats_url
                .as_deref()
                .context("NATS_URL required for NATS bus")?;
            tracing::info!("Connecting to NATS at {}", nats_url);
            let nats_client = async_nats::connect(nats_url)
                .await
                .context("Failed to connect to NATS")?;
            event_bus::jetstream_setup::ensure_streams(
                &nats_client,
                &[config.input_topic.as_str(), config.output_topic.as_str()],
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to provision JetStream streams: {}", e))?;
            Arc::new(NatsBus::new(nats_client))
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let features: Arc<dyn FeatureStore> = match &config.feature_store {
        FeatureStoreType::Feast { url } => {
            tracing::info!(url = %url, "Using Feast feature store");
            let http = reqwest::Client::builder()
                .timeout(config.http_timeout)
                .build()
                .context("Failed to build HTTP client")?;
            Arc::new(FeastFeatureStore::new(http, url.clone()))
        }
        FeatureStoreType::InMemory => {
            tracing::warn!("Using empty in-memory feature store; every envelope will be skipped");
            Arc::new(InMemoryFeatureStore::new())
        }
    };

    let metrics = Metrics::new().context("Failed to register metrics")?;
    let dispatcher = EnrichmentDispatcher::new(
        pipelines,
        features,
        EnvelopePublisher::new(bus.clone()),
        config.output_topic.clone(),
        metrics.clone(),
    )
    .with_retry(RetryConfig::with_max_attempts(config.retry_max_attempts));

    let consumer = EnvelopeConsumer::<CanonicalEnvelope>::subscribe(
        bus.as_ref(),
        &config.input_topic,
        &config.consumer_name,
    )
    .await
    .context("Failed to subscribe to input topic")?;

    let (trigger, shutdown) = shutdown_channel();
    let handle = prediction::spawn_dispatcher(Arc::new(dispatcher), consumer, shutdown);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, finishing in-flight envelope");
    trigger.trigger();

    match handle.await {
        Ok(stats) => tracing::info!(
            acked = stats.acked,
            quarantined = stats.quarantined,
            left_for_redelivery = stats.left_for_redelivery,
            "Prediction service stopped"
        ),
        Err(e) => tracing::error!(error = %e, "Dispatcher task failed"),
    }
    match metrics.render() {
        Ok(text) => tracing::debug!(metrics = %text, "Final counters"),
        Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
