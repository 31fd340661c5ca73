//! Configuration management for the real-time gateway.
//!
//! Settings come from optional config files and `GATEWAY__*` environment
//! variables.

use config::{Config, ConfigError, Environment, File};
use pixcast_pipeline::{KafkaConfig, RetryConfig};
use pixcast_storage::config::DatabaseConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listener and socket behaviour
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection registry storage
    pub database: DatabaseConfig,

    /// Kafka, used for dead letters of failed registry updates
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP listener and WebSocket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between keepalive pings sent to each client
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Prefix of every connection id minted here. Must stay stable across
    /// restarts so ids left behind by a crash are still answered as gone.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8081
}
fn default_ping_interval() -> u64 {
    30
}
fn default_instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "gateway".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ping_interval_secs: default_ping_interval(),
            instance_id: default_instance_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/gateway`
    /// 2. `config/{RUN_MODE}`
    /// 3. Environment variables (e.g. `GATEWAY__SERVER__PORT`)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            .add_source(File::with_name("config/gateway").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.server.ping_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.ping_interval_secs".to_string(),
                message: "Ping interval must be greater than 0".to_string(),
            });
        }

        if self.server.instance_id.is_empty() || self.server.instance_id.contains(':') {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.instance_id".to_string(),
                message: "Instance id must be non-empty and must not contain ':'".to_string(),
            });
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })?;

        self.retry
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "retry".to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
