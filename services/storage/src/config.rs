use pixcast_pipeline::{KafkaConfig, RetryConfig, DEFAULT_BROADCAST_CONCURRENCY, DEFAULT_THUMBNAIL_WIDTH};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub s3: S3Config,
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub push: PushConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 buckets for source images and thumbnails
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket clients upload original images to
    pub images_bucket: String,
    /// Bucket thumbnails are written to
    pub thumbnails_bucket: String,
    /// Prepended to the source key to form the thumbnail key
    #[serde(default)]
    pub thumbnail_key_prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Lifetime of the signed upload URL returned by the API
    #[serde(default = "default_upload_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Search backend (Elasticsearch-compatible REST API)
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    #[serde(default = "default_search_index")]
    pub index: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// Push gateway that owns the live client connections
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Base URL; pushes go to `{url}/connections/{id}`
    pub url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// Which pipeline workers run in this process and how
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub thumbnails_enabled: bool,
    #[serde(default = "default_true")]
    pub search_enabled: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    /// Pushes in flight per broadcast
    #[serde(default = "default_broadcast_concurrency")]
    pub broadcast_concurrency: usize,
    /// How often queued change events are retried onto the feed
    #[serde(default = "default_relay_interval_ms")]
    pub relay_interval_ms: u64,
}

/// API configuration for the ingestion endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_service_name() -> String {
    "storage-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_url_expiry_secs() -> u64 {
    300
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_search_index() -> String {
    "images-index".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_thumbnail_width() -> u32 {
    DEFAULT_THUMBNAIL_WIDTH
}

fn default_broadcast_concurrency() -> usize {
    DEFAULT_BROADCAST_CONCURRENCY
}

fn default_relay_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "storage-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/pixcast/storage").required(false))
            // STORAGE__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.kafka.validate()?;
        self.retry.validate()?;

        if self.s3.images_bucket.is_empty() {
            anyhow::bail!("s3.images_bucket must not be empty");
        }
        if self.s3.thumbnails_bucket.is_empty() {
            anyhow::bail!("s3.thumbnails_bucket must not be empty");
        }
        if self.workers.thumbnail_width == 0 {
            anyhow::bail!("workers.thumbnail_width must be greater than 0");
        }
        if self.workers.relay_interval_ms == 0 {
            anyhow::bail!("workers.relay_interval_ms must be greater than 0");
        }

        Ok(())
    }

    pub fn upload_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.upload_url_expiry_secs)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.workers.relay_interval_ms)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thumbnails_enabled: true,
            search_enabled: true,
            notifications_enabled: true,
            thumbnail_width: default_thumbnail_width(),
            broadcast_concurrency: default_broadcast_concurrency(),
            relay_interval_ms: default_relay_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
