use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErpSource {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub poll_interval: Duration,
}

/// An optional external feed, enabled when its URL is set
#[derive(Debug, Clone)]
pub struct HttpSource {
    pub url: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: Option<String>,
    pub erp: ErpSource,
    pub weather: Option<HttpSource>,
    pub market_data: Option<HttpSource>,
    pub exchange_rates: Option<HttpSource>,
    /// Fixed sleep after a failed poll cycle
    pub backoff: Duration,
    pub erp_topic: String,
    pub external_data_topic: String,
    /// Envelopes kept for re-publish after a broker failure
    pub max_pending: usize,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let erp = ErpSource {
            base_url: non_empty("ERP_BASE_URL").ok_or("ERP_BASE_URL must be set")?,
            auth_token: non_empty("ERP_AUTH_TOKEN"),
            poll_interval: secs("ERP_POLL_INTERVAL_SECS", 60)?,
        };

        let weather = match non_empty("WEATHER_API_URL") {
            Some(url) => Some(HttpSource {
                url,
                api_key: non_empty("WEATHER_API_KEY"),
                poll_interval: secs("WEATHER_POLL_INTERVAL_SECS", 300)?,
            }),
            None => None,
        };

        let market_data = match non_empty("MARKET_DATA_URL") {
            Some(url) => Some(HttpSource {
                url,
                api_key: non_empty("MARKET_DATA_API_KEY"),
                poll_interval: secs("MARKET_DATA_POLL_INTERVAL_SECS", 600)?,
            }),
            None => None,
        };

        let exchange_rates = match non_empty("FX_RATES_URL") {
            Some(url) => Some(HttpSource {
                url,
                api_key: non_empty("FX_RATES_API_KEY"),
                poll_interval: secs("FX_POLL_INTERVAL_SECS", 900)?,
            }),
            None => None,
        };

        let max_pending = match non_empty("MAX_PENDING_ENVELOPES") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| format!("MAX_PENDING_ENVELOPES must be an integer, got '{}'", raw))?,
            None => 1000,
        };

        Ok(Self {
            bus_type,
            nats_url,
            erp,
            weather,
            market_data,
            exchange_rates,
            backoff: secs("POLL_BACKOFF_SECS", 10)?,
            erp_topic: non_empty("ERP_TOPIC").unwrap_or_else(|| "erp-events".to_string()),
            external_data_topic: non_empty("EXTERNAL_DATA_TOPIC")
                .unwrap_or_else(|| "external-data".to_string()),
            max_pending,
            http_timeout: secs("HTTP_TIMEOUT_SECS", 10)?,
        })
    }

    /// Every topic this service publishes to
    pub fn topics(&self) -> Vec<&str> {
        let mut topics = vec![self.erp_topic.as_str()];
        let external = self.weather.is_some()
            || self.market_data.is_some()
            || self.exchange_rates.is_some();
        if external && self.external_data_topic != self.erp_topic {
            topics.push(self.external_data_topic.as_str());
        }
        topics
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs(name: &str, default: u64) -> Result<Duration, String> {
    match non_empty(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(format!(
                "{} must be a positive number of seconds, got '{}'",
                name, raw
            )),
            Ok(n) => Ok(Duration::from_secs(n)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BUS_TYPE",
        "NATS_URL",
        "ERP_BASE_URL",
        "ERP_AUTH_TOKEN",
        "ERP_POLL_INTERVAL_SECS",
        "WEATHER_API_URL",
        "WEATHER_API_KEY",
        "WEATHER_POLL_INTERVAL_SECS",
        "MARKET_DATA_URL",
        "FX_RATES_URL",
        "POLL_BACKOFF_SECS",
        "ERP_TOPIC",
        "EXTERNAL_DATA_TOPIC",
        "MAX_PENDING_ENVELOPES",
        "HTTP_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        env::set_var("ERP_BASE_URL", "http://erp.local");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, BusType::InMemory);
        assert!(config.nats_url.is_none());
        assert_eq!(config.erp.poll_interval, Duration::from_secs(60));
        assert_eq!(config.backoff, Duration::from_secs(10));
        assert_eq!(config.erp_topic, "erp-events");
        assert_eq!(config.max_pending, 1000);
        assert!(config.weather.is_none());
        assert_eq!(config.topics(), vec!["erp-events"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_erp_url_fails() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(err.contains("ERP_BASE_URL"));
    }

    #[test]
    #[serial]
    fn test_invalid_interval_fails() {
        clear_env();
        env::set_var("ERP_BASE_URL", "http://erp.local");
        env::set_var("POLL_BACKOFF_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("POLL_BACKOFF_SECS"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_nats_and_external_sources() {
        clear_env();
        env::set_var("BUS_TYPE", "NATS");
        env::set_var("ERP_BASE_URL", "http://erp.local");
        env::set_var("WEATHER_API_URL", "http://weather.local");
        env::set_var("WEATHER_POLL_INTERVAL_SECS", "120");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, BusType::Nats);
        assert_eq!(config.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(
            config.weather.as_ref().unwrap().poll_interval,
            Duration::from_secs(120)
        );
        assert_eq!(config.topics(), vec!["erp-events", "external-data"]);
        clear_env();
    }
}
