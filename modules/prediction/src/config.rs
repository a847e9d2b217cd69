use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BusType {
    Nats,
    InMemory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureStoreType {
    /// Feast online serving at the given base URL
    Feast { url: String },
    InMemory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: Option<String>,
    pub input_topic: String,
    pub output_topic: String,
    /// Durable consumer name; restarts resume after its last ack
    pub consumer_name: String,
    pub feature_store: FeatureStoreType,
    pub model_artifact: PathBuf,
    /// Confidence stamped on every prediction
    pub confidence: f64,
    pub retry_max_attempts: u32,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = match var_or("BUS_TYPE", "inmemory").to_lowercase().as_str() {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        };
        let nats_url = match bus_type {
            BusType::Nats => Some(var_or("NATS_URL", "nats://localhost:4222")),
            BusType::InMemory => None,
        };

        let feature_store = match var_or("FEATURE_STORE_TYPE", "feast").to_lowercase().as_str() {
            "feast" => FeatureStoreType::Feast {
                url: var_or("FEATURE_STORE_URL", "http://localhost:6566"),
            },
            "inmemory" => FeatureStoreType::InMemory,
            other => {
                return Err(format!(
                    "FEATURE_STORE_TYPE must be 'feast' or 'inmemory', got '{}'",
                    other
                ))
            }
        };

        let model_artifact = env::var("MODEL_ARTIFACT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or("MODEL_ARTIFACT must be set")?;

        let confidence: f64 = parse("PREDICTION_CONFIDENCE", 0.85)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!(
                "PREDICTION_CONFIDENCE must be within 0.0..=1.0, got {}",
                confidence
            ));
        }

        let retry_max_attempts: u32 = parse("RETRY_MAX_ATTEMPTS", 3)?;
        if retry_max_attempts == 0 {
            return Err("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }

        let http_timeout: u64 = parse("HTTP_TIMEOUT_SECS", 10)?;

        Ok(Self {
            bus_type,
            nats_url,
            input_topic: var_or("INPUT_TOPIC", "erp-events"),
            output_topic: var_or("OUTPUT_TOPIC", "predictions-alerts"),
            consumer_name: var_or("CONSUMER_NAME", "prediction-service"),
            feature_store,
            model_artifact,
            confidence,
            retry_max_attempts,
            http_timeout: Duration::from_secs(http_timeout),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value '{}'", name, raw)),
        _ => Ok(default),
    }
}
