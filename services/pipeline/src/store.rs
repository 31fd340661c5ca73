//! Capabilities the pipeline consumes from durable stores and transports.
//!
//! Each trait is narrow: per-key reads and writes, a full scan for
//! connections, and the image store's change outbox. Production adapters live in the storage service;
//! in-memory versions live in [`crate::memory`].

use crate::model::{ChangeEvent, ImageRecord, SearchDocument};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by store adapters
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected by store: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of a failed point-to-point push
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The transport no longer knows the endpoint
    #[error("Connection is gone")]
    Gone,

    #[error("Push failed: {0}")]
    Other(String),
}

/// Blob storage keyed by object key
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
}

/// Group lookup used by the ingestion writer
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError>;
}

/// A change event queued in the image store's outbox
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub change_id: String,
    pub event: ChangeEvent,
}

impl PendingChange {
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            event,
        }
    }
}

/// Durable image metadata with an outbox of unpublished changes.
///
/// `put_image` stores the record and queues its change in one atomic write,
/// so every stored record has a change that is either pending or published.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put_image(&self, record: &ImageRecord, change: &PendingChange)
        -> Result<(), StoreError>;

    /// Unpublished changes, oldest first
    async fn pending_changes(&self, limit: usize) -> Result<Vec<PendingChange>, StoreError>;

    async fn mark_published(&self, change_id: &str) -> Result<(), StoreError>;
}

/// Origin of the metadata change feed
#[async_trait]
pub trait ChangeFeedPublisher: Send + Sync {
    async fn publish_change(&self, event: &ChangeEvent) -> Result<(), StoreError>;
}

/// Full-text search backend; `upsert` replaces the whole document
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), StoreError>;
}

/// Per-key storage for live connection ids
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn put_connection(&self, connection_id: &str) -> Result<(), StoreError>;

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError>;

    async fn scan_connections(&self) -> Result<Vec<String>, StoreError>;
}

/// Point-to-point push over the persistent transport
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, connection_id: &str, payload: &[u8]) -> Result<(), PushError>;
}
