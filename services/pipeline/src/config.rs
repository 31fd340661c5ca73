//! Pipeline configuration: Kafka connectivity, feed topics and the
//! dispatcher's retry policy.
//!
//! Services embed these structs in their own configuration and load them
//! with the `config` crate; nothing here reads global state.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    /// PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512
    #[serde(default = "default_sasl_mechanism")]
    pub mechanism: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

/// Consumer settings shared by every subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Base consumer group; each subscriber appends its own suffix
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// earliest or latest
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "pixcast".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Producer delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_true() -> bool {
    true
}

fn default_linger_ms() -> u64 {
    5
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            enable_idempotence: true,
            linger_ms: default_linger_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Topics carrying the pipeline's feeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Object-created notifications from the blob store
    #[serde(default = "default_object_created_topic")]
    pub object_created: String,
    /// Image metadata change feed, keyed by group id
    #[serde(default = "default_image_changes_topic")]
    pub image_changes: String,
    /// Dead letters from every subscriber
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_object_created_topic() -> String {
    "pixcast.objects.created".to_string()
}

fn default_image_changes_topic() -> String {
    "pixcast.images.changes".to_string()
}

fn default_dlq_topic() -> String {
    "pixcast.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            object_created: default_object_created_topic(),
            image_changes: default_image_changes_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Kafka connectivity for feeds and the dead-letter queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    /// CA certificate for SSL
    pub ssl_ca_location: Option<String>,
    #[serde(default)]
    pub sasl: SaslConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "pixcast".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl_ca_location: None,
            sasl: SaslConfig::default(),
            consumer: ConsumerConfig::default(),
            producer: ProducerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Consumer group for one subscriber.
    ///
    /// Distinct groups give every subscriber its own copy of each event.
    pub fn subscriber_group(&self, subscriber: &str) -> String {
        format!("{}.{}", self.consumer.group_id, subscriber)
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", &self.sasl.mechanism);
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("acks", &self.producer.acks);
        config.set("linger.ms", self.producer.linger_ms.to_string());
        config.set(
            "request.timeout.ms",
            self.producer.request_timeout_ms.to_string(),
        );
        if self.producer.enable_idempotence {
            config.set("enable.idempotence", "true");
        }

        config
    }

    /// Consumer config for one subscriber; offsets are committed manually
    /// after dispatch.
    pub fn build_consumer_config(&self, subscriber: &str) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", self.subscriber_group(subscriber));
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers".to_string()));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id".to_string()));
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Retry policy applied by the dispatcher to every handler invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Wall-clock budget of one invocation
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_invocation_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.invocation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.invocation_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.multiplier".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.topics.image_changes, "pixcast.images.changes");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subscribers_get_distinct_groups() {
        let config = KafkaConfig::new("broker:9092");

        let indexer = config.build_consumer_config("search-indexer");
        let broadcaster = config.build_consumer_config("notification-broadcaster");

        assert_eq!(indexer.get("group.id"), Some("pixcast.search-indexer"));
        assert_eq!(
            broadcaster.get("group.id"),
            Some("pixcast.notification-broadcaster")
        );
        assert_eq!(indexer.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_sasl_requires_username() {
        let mut config = KafkaConfig::default();
        config.security_protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        config.sasl.username = Some("pixcast".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.build_producer_config().get("sasl.username"),
            Some("pixcast")
        );
    }

    #[test]
    fn test_retry_validation() {
        assert!(RetryConfig::default().validate().is_ok());

        let zero_attempts = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let no_timeout = RetryConfig {
            invocation_timeout_ms: 0,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }
}
