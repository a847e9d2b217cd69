use anyhow::Context;
use event_bus::{shutdown_channel, EnvelopePublisher, EventBus, InMemoryBus, NatsBus};
use ingestion::config::{BusType, Config};
use ingestion::metrics::Metrics;
use ingestion::sources::build_adapters;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!(bus_type = ?config.bus_type, topics = ?config.topics(), "Configuration loaded");

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
            event_bus::jetstream_setup::ensure_streams(&nats_client, &config.topics())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to provision JetStream streams: {}", e))?;
            Arc::new(NatsBus::new(nats_client))
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let metrics = Metrics::new().context("Failed to register metrics")?;

    let bindings = build_adapters(&config, http);
    for binding in &bindings {
        tracing::info!(
            source_system = %binding.adapter.source_system(),
            topic = %binding.topic,
            poll_interval_secs = binding.adapter.poll_interval().as_secs(),
            "Source enabled"
        );
    }

    let (trigger, shutdown) = shutdown_channel();
    let handles = ingestion::spawn_supervisors(
        bindings,
        EnvelopePublisher::new(bus),
        config.backoff,
        config.max_pending,
        metrics,
        shutdown,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, finishing in-flight cycles");
    trigger.trigger();

    for handle in handles {
        match handle.await {
            Ok(state) => tracing::debug!(?state, "Poll loop joined"),
            Err(e) => tracing::error!(error = %e, "Poll loop task failed"),
        }
    }

    tracing::info!("Ingestion service stopped");
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
