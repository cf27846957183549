//! Deployment configuration, read from a JSON file.
//!
//! ```json
//! {
//!   "broker": {
//!     "url": "broker.example.com",
//!     "port": 8883,
//!     "client_id": "notifier-1",
//!     "username": "notifier",
//!     "password": "secret"
//!   },
//!   "feed": {
//!     "source": "https://opendata.hamilton.ca/GTFS-RT/GTFS_TripUpdates.pb",
//!     "routes": "static/routes.txt",
//!     "stops": "static/stops.txt"
//!   },
//!   "poll": { "interval_secs": 5 },
//!   "dispatch": { "max_retries": 3, "timeout_secs": 5 },
//!   "subscribes": [
//!     { "topic": "bus/01/king-james", "qos": 1, "route_id": "4384", "stop_id": "S1" }
//!   ]
//! }
//! ```
//!
//! With `"transport": "http"` the broker `url` is instead the base URL of an
//! HTTP publish endpoint, authenticated with `api_key`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rumqttc::QoS;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::dispatch::DispatchPolicy;
use crate::matcher::Subscription;
use crate::publish::{MqttSettings, qos_level};

/// Environment variable that overrides `broker.api_key`.
pub const BROKER_API_KEY_ENV: &str = "BROKER_API_KEY";
/// Environment variable that overrides `broker.password`.
pub const BROKER_PASSWORD_ENV: &str = "BROKER_PASSWORD";

const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_RETRIES: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub subscribes: Vec<SubscribeConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransport {
    #[default]
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub transport: BrokerTransport,
    /// MQTT broker host, or the publish endpoint's base URL for HTTP.
    pub url: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Connect to the MQTT broker over TLS.
    #[serde(default = "default_tls")]
    pub tls: bool,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    /// Send `api_key` in this header. Defaults to `Authorization: Bearer`.
    pub api_key_header: Option<String>,
    /// Send `api_key` as this query parameter instead of a header.
    pub api_key_param: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// URL or local path of the GTFS-RT trip updates snapshot.
    pub source: String,
    pub routes: String,
    pub stops: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeConfig {
    pub topic: String,
    /// MQTT delivery guarantee for this topic. Not used for matching.
    #[serde(default = "default_qos")]
    pub qos: u8,
    pub route_id: String,
    pub stop_id: String,
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_tls() -> bool {
    true
}

fn default_qos() -> u8 {
    1
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Loads the config from `path` and applies environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config = Self::from_json(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides secrets from the environment, looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(BROKER_API_KEY_ENV).filter(|k| !k.is_empty()) {
            self.broker.api_key = Some(key);
        }
        if let Some(password) = lookup(BROKER_PASSWORD_ENV).filter(|p| !p.is_empty()) {
            self.broker.password = Some(password);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_broker()?;

        if self.poll.interval_secs == 0 {
            return Err(ConfigError::Invalid("poll.interval_secs must be positive".into()));
        }

        if self.dispatch.timeout_secs == 0 || self.dispatch.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "dispatch.timeout_secs must be between 1 and {MAX_TIMEOUT_SECS}"
            )));
        }

        if self.dispatch.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "dispatch.max_retries must be at most {MAX_RETRIES}"
            )));
        }

        let mut seen = HashSet::new();
        for (i, sub) in self.subscribes.iter().enumerate() {
            if sub.topic.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("subscribes[{i}] has an empty topic")));
            }
            if qos_level(sub.qos).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "subscribes[{i}].qos must be 0, 1 or 2, got {}",
                    sub.qos
                )));
            }
            if !seen.insert(sub.topic.as_str()) {
                warn!(topic = %sub.topic, "Topic subscribed more than once, last entry wins");
            }
        }

        Ok(())
    }

    fn validate_broker(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        match broker.transport {
            BrokerTransport::Mqtt => {
                if broker.url.trim().is_empty() || broker.url.contains("://") {
                    return Err(ConfigError::Invalid(
                        "broker.url must be a bare host name for the mqtt transport".into(),
                    ));
                }
                if broker.port == 0 {
                    return Err(ConfigError::Invalid("broker.port must be positive".into()));
                }
                match broker.client_id.as_deref() {
                    Some(id) if !id.is_empty() && !id.starts_with(' ') => {}
                    _ => {
                        return Err(ConfigError::Invalid(
                            "broker.client_id is required for the mqtt transport".into(),
                        ));
                    }
                }
            }
            BrokerTransport::Http => {
                if broker.api_key_header.is_some() && broker.api_key_param.is_some() {
                    return Err(ConfigError::Invalid(
                        "broker.api_key_header and broker.api_key_param are mutually exclusive"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Connection settings for the MQTT transport.
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.url.clone(),
            port: self.broker.port,
            client_id: self.broker.client_id.clone().unwrap_or_default(),
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            tls: self.broker.tls,
        }
    }

    /// Delivery QoS of every subscribed topic. The last subscription of a topic wins.
    pub fn topic_qos(&self) -> HashMap<String, QoS> {
        self.subscribes
            .iter()
            .filter_map(|s| qos_level(s.qos).ok().map(|qos| (s.topic.clone(), qos)))
            .collect()
    }

    /// Subscriptions in configuration order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscribes
            .iter()
            .map(|s| {
                Subscription::new(s.topic.as_str(), s.route_id.as_str(), s.stop_id.as_str())
            })
            .collect()
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_retries: self.dispatch.max_retries,
            attempt_timeout: Duration::from_secs(self.dispatch.timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "broker": {
            "url": "broker.example.com", "port": 8884, "client_id": "n1",
            "username": "notifier", "password": "file-password"
        },
        "feed": { "source": "feed.pb", "routes": "routes.txt", "stops": "stops.txt" },
        "poll": { "interval_secs": 10 },
        "dispatch": { "max_retries": 5, "timeout_secs": 2 },
        "subscribes": [
            { "topic": "t1", "qos": 0, "route_id": "A", "stop_id": "S1" },
            { "topic": "t2", "route_id": "B", "stop_id": "S2" }
        ]
    }"#;

    const MINIMAL: &str = r#"{
        "broker": { "url": "broker.example.com", "client_id": "n1" },
        "feed": { "source": "feed.pb", "routes": "routes.txt", "stops": "stops.txt" }
    }"#;

    const HTTP: &str = r#"{
        "broker": { "transport": "http", "url": "https://broker.example.com", "api_key": "file-key" },
        "feed": { "source": "feed.pb", "routes": "routes.txt", "stops": "stops.txt" }
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_json(FULL).unwrap();

        assert_eq!(config.broker.transport, BrokerTransport::Mqtt);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(
            config.dispatch_policy(),
            DispatchPolicy {
                max_retries: 5,
                attempt_timeout: Duration::from_secs(2),
            }
        );
        assert_eq!(
            config.subscriptions(),
            vec![
                Subscription::new("t1", "A", "S1"),
                Subscription::new("t2", "B", "S2"),
            ]
        );
        assert_eq!(config.subscribes[0].qos, 0);
        assert_eq!(config.subscribes[1].qos, 1);
    }

    #[test]
    fn test_mqtt_settings() {
        let settings = Config::from_json(FULL).unwrap().mqtt_settings();

        assert_eq!(settings.host, "broker.example.com");
        assert_eq!(settings.port, 8884);
        assert_eq!(settings.client_id, "n1");
        assert_eq!(settings.username.as_deref(), Some("notifier"));
        assert_eq!(settings.password.as_deref(), Some("file-password"));
        assert!(settings.tls);
    }

    #[test]
    fn test_topic_qos() {
        let qos = Config::from_json(FULL).unwrap().topic_qos();

        assert_eq!(qos["t1"], QoS::AtMostOnce);
        assert_eq!(qos["t2"], QoS::AtLeastOnce);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();

        assert_eq!(config.broker.transport, BrokerTransport::Mqtt);
        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.tls);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatch_policy(), DispatchPolicy::default());
        assert!(config.subscriptions().is_empty());
    }

    #[test]
    fn test_http_transport() {
        let config = Config::from_json(HTTP).unwrap();

        assert_eq!(config.broker.transport, BrokerTransport::Http);
        assert_eq!(config.broker.api_key.as_deref(), Some("file-key"));
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = Config::from_json(FULL).unwrap();
        config.apply_env(|key| match key {
            BROKER_API_KEY_ENV => Some("env-key".to_string()),
            BROKER_PASSWORD_ENV => Some("env-password".to_string()),
            _ => None,
        });
        assert_eq!(config.broker.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.broker.password.as_deref(), Some("env-password"));
    }

    #[test]
    fn test_empty_env_keeps_file_secrets() {
        let mut config = Config::from_json(HTTP).unwrap();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.broker.api_key.as_deref(), Some("file-key"));

        let mut config = Config::from_json(FULL).unwrap();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.broker.password.as_deref(), Some("file-password"));
    }

    #[test]
    fn test_rejects_empty_topic() {
        let json = MINIMAL.replace(
            "\"feed\"",
            r#""subscribes": [{ "topic": " ", "route_id": "A", "stop_id": "S1" }], "feed""#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_qos() {
        let json = MINIMAL.replace(
            "\"feed\"",
            r#""subscribes": [{ "topic": "t1", "qos": 3, "route_id": "A", "stop_id": "S1" }], "feed""#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_conflicting_auth() {
        let json = HTTP.replace(
            r#""api_key": "file-key""#,
            r#""api_key": "file-key", "api_key_header": "X-Key", "api_key_param": "key""#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_mqtt_requires_client_id() {
        let json = MINIMAL.replace(r#", "client_id": "n1""#, "");
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_mqtt_rejects_url_scheme() {
        let json = MINIMAL.replace("broker.example.com", "tls://broker.example.com");
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_oversized_dispatch_settings() {
        let json = MINIMAL.replace(
            "\"feed\"",
            r#""dispatch": { "timeout_secs": 18446744073709551615 }, "feed""#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));

        let json = MINIMAL.replace(
            "\"feed\"",
            r#""dispatch": { "max_retries": 4294967295 }, "feed""#,
        );
        assert!(matches!(Config::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_missing_broker() {
        let json = r#"{ "feed": { "source": "a", "routes": "b", "stops": "c" } }"#;
        assert!(matches!(Config::from_json(json), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/config.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
