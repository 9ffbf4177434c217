//! Bridge configuration.
//!
//! Loaded from a YAML file mirroring the service's deployment layout:
//!
//! ```yaml
//! mqtt:
//!   broker: "broker.example.com:1883"
//!   topics:
//!     - "sensors/#"
//!     - "devices/+/events"
//! otlp:
//!   endpoint: "http://collector:4318"
//! ```
//!
//! All three of broker, topics and endpoint are required; validation failures
//! are reported before any connection attempt. The optional `tuning` block
//! carries knobs that default sensibly.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating the configuration. All are fatal pre-start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid YAML for this schema
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The configuration parsed but violates an invariant
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration. Immutable after [`BridgeConfig::load`].
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    pub otlp: OtlpSection,
    #[serde(default)]
    pub tuning: TuningSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    /// Broker address, `host:port` (port defaults to 1883 when omitted).
    /// `mqtt://` and `tcp://` prefixes are accepted.
    pub broker: String,
    /// Fixed client identifier, reused across reconnects
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic filters to subscribe, `+`/`#` wildcards allowed
    pub topics: Vec<String>,
}

/// Trace collector settings
#[derive(Debug, Clone, Deserialize)]
pub struct OtlpSection {
    /// Collector base endpoint; spans are POSTed to `{endpoint}/v1/traces`
    pub endpoint: String,
    /// Value reported as the `service.name` resource attribute
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// Optional tuning knobs with production defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    /// Payloads above this size are summarized (size only) instead of being
    /// recorded verbatim as a span attribute
    pub max_payload_attr_bytes: usize,
    /// Spans per export batch
    pub max_batch_size: usize,
    /// Maximum milliseconds between flushes
    pub max_batch_interval_ms: u64,
    /// Hard cap on buffered spans before the oldest is dropped
    pub max_buffer_capacity: usize,
    /// Milliseconds granted to the broker disconnect handshake
    pub disconnect_timeout_ms: u64,
    /// Milliseconds granted to the final span flush at shutdown
    pub shutdown_timeout_ms: u64,
}

fn default_client_id() -> String {
    "mqtt-otlp-bridge".to_string()
}

fn default_service_name() -> String {
    "mqtt-otlp-bridge".to_string()
}

impl Default for TuningSection {
    fn default() -> Self {
        Self {
            max_payload_attr_bytes: 1024,
            max_batch_size: 512,
            max_batch_interval_ms: 5000,
            max_buffer_capacity: 2048,
            // the reference client granted its disconnect 250ms
            disconnect_timeout_ms: 250,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl TuningSection {
    pub fn max_batch_interval(&self) -> Duration {
        Duration::from_millis(self.max_batch_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl BridgeConfig {
    /// Reads and validates the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforces the configuration invariants: non-empty broker and endpoint,
    /// at least one non-empty topic filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.broker must not be empty".into()));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.client_id must not be empty".into(),
            ));
        }
        if self.mqtt.topics.is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.topics must list at least one topic filter".into(),
            ));
        }
        if let Some(i) = self.mqtt.topics.iter().position(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.topics[{i}] is an empty topic filter"
            )));
        }
        if self.otlp.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "otlp.endpoint must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mqtt:
  broker: "broker.local:1883"
  topics:
    - "sensors/#"
    - "devices/+/events"
otlp:
  endpoint: "http://collector:4318"
"#;

    #[test]
    fn test_minimal_config_with_defaults() {
        let config = BridgeConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.mqtt.broker, "broker.local:1883");
        assert_eq!(config.mqtt.client_id, "mqtt-otlp-bridge");
        assert_eq!(config.mqtt.topics.len(), 2);
        assert_eq!(config.otlp.endpoint, "http://collector:4318");
        assert_eq!(config.tuning.max_batch_size, 512);
        assert_eq!(config.tuning.max_batch_interval(), Duration::from_secs(5));
        assert_eq!(config.tuning.disconnect_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_tuning_overrides() {
        let raw = r#"
mqtt:
  broker: "broker.local"
  topics: ["t"]
otlp:
  endpoint: "http://collector:4318"
tuning:
  max_batch_size: 64
  shutdown_timeout_ms: 2500
"#;
        let config = BridgeConfig::from_yaml(raw).unwrap();
        assert_eq!(config.tuning.max_batch_size, 64);
        assert_eq!(config.tuning.shutdown_timeout(), Duration::from_millis(2500));
        // untouched knobs keep their defaults
        assert_eq!(config.tuning.max_buffer_capacity, 2048);
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let raw = r#"
mqtt:
  broker: "broker.local"
otlp:
  endpoint: "http://collector:4318"
"#;
        assert!(matches!(
            BridgeConfig::from_yaml(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_topics_rejected() {
        let raw = r#"
mqtt:
  broker: "broker.local"
  topics: []
otlp:
  endpoint: "http://collector:4318"
"#;
        assert!(matches!(
            BridgeConfig::from_yaml(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_blank_topic_rejected() {
        let raw = r#"
mqtt:
  broker: "broker.local"
  topics: ["sensors/#", "  "]
otlp:
  endpoint: "http://collector:4318"
"#;
        let err = BridgeConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("mqtt.topics[1]"));
    }

    #[test]
    fn test_blank_endpoint_rejected() {
        let raw = r#"
mqtt:
  broker: "broker.local"
  topics: ["t"]
otlp:
  endpoint: ""
"#;
        assert!(matches!(
            BridgeConfig::from_yaml(raw),
            Err(ConfigError::Invalid(_))
        ));
    }
}
