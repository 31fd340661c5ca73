//! Pixcast storage service
//!
//! Production backends for the pipeline plus the two processes' worth of
//! wiring that run in this binary:
//!
//! - the ingestion API, which creates image records and hands out signed
//!   upload URLs
//! - one Kafka consumer group per pipeline handler, so each subscriber
//!   tracks its own offsets and can fail independently
//!
//! ## Architecture
//!
//! ```text
//!  client ──POST──▶ ingestion API ──▶ PostgreSQL (groups, images)
//!                        │
//!                        └──▶ image_changes ──┬──▶ search-indexer ──▶ search index
//!                                             └──▶ notification-broadcaster ──▶ push gateway
//!  client ──PUT───▶ S3 images ──▶ object_created ──▶ thumbnail-generator ──▶ S3 thumbnails
//! ```

pub mod api;
pub mod config;
pub mod metadata_store;
pub mod push;
pub mod s3_store;
pub mod search;
pub mod workers;

pub use api::{create_router, start_api_server, AppState, CreateImageResponse, UploadUrlSigner};
pub use config::Config;
pub use metadata_store::MetadataStore;
pub use push::HttpPushTransport;
pub use s3_store::S3BlobStore;
pub use search::ElasticsearchBackend;
pub use workers::{PipelineWorkers, WorkerDeps};
