//! Pixcast pipeline - event fan-out for image ingestion
//!
//! A new image produces two events. The blob store announces the uploaded
//! object, and the record store's change feed announces the new record.
//! Independent stateless handlers react to them:
//!
//! - [`ThumbnailGenerator`] writes a resized derivative for each new object
//! - [`SearchIndexer`] upserts a search document for each new record
//! - [`NotificationBroadcaster`] pushes a refetch signal to every live client
//!
//! [`IngestionWriter`] is the write path that creates records; their change
//! events go through a store outbox drained by the [`OutboxRelay`].
//! [`ConnectionRegistry`] tracks the live client connections.
//!
//! Feeds are at-least-once, so handlers are idempotent. Retry, timeout and
//! dead-lettering are owned by the [`Dispatcher`], in-process through a
//! [`Topic`] or across processes through [`EventConsumer`] subscriptions.
//!
//! # Example
//!
//! ```rust,no_run
//! use pixcast_pipeline::prelude::*;
//! use pixcast_pipeline::ChangeEvent;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::new("localhost:9092");
//!     let producer = Arc::new(EventProducer::new(config.clone())?);
//!     let dispatcher = Arc::new(Dispatcher::new(RetryConfig::default(), producer));
//!
//!     let indexer = Arc::new(SearchIndexer::new(Arc::new(MemorySearchBackend::new())));
//!     let consumer = EventConsumer::new(&config, "search-indexer", &config.topics.image_changes)?;
//!     consumer
//!         .run::<ChangeEvent, _, _>(indexer, dispatcher, JsonDecoder)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod indexer;
pub mod ingestion;
pub mod memory;
pub mod model;
pub mod producer;
pub mod registry;
pub mod relay;
pub mod store;
pub mod thumbnail;
pub mod topic;

pub use broadcaster::{BroadcastReport, NotificationBroadcaster, DEFAULT_BROADCAST_CONCURRENCY};
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, RetryConfig, SaslConfig,
    SecurityProtocol, TopicConfig,
};
pub use consumer::{
    ConsumerError, EventConsumer, IncomingMessage, JsonDecoder, MessageDecoder, MessageMetadata,
};
pub use dispatcher::{DeadLetter, DeadLetterSink, DispatchOutcome, Dispatcher};
pub use handler::{EventHandler, HandlerError};
pub use indexer::SearchIndexer;
pub use ingestion::{now_iso8601, IngestError, IngestionWriter};
pub use model::{
    ChangeEvent, ChangeOperation, ConnectionEvent, ImageNotification, ImageRecord,
    NotificationType, ObjectCreatedEvent, SearchDocument, RESERVED_FIELDS,
};
pub use producer::{DeliveryResult, EventProducer, OutgoingMessage, ProducerError};
pub use registry::ConnectionRegistry;
pub use relay::OutboxRelay;
pub use store::{
    BlobStore, ChangeFeedPublisher, ConnectionStore, GroupStore, ImageStore, PendingChange,
    PushError, PushTransport, SearchBackend, StoreError,
};
pub use thumbnail::{ThumbnailGenerator, DEFAULT_THUMBNAIL_WIDTH};
pub use topic::{Delivery, Topic};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{KafkaConfig, RetryConfig};
    pub use crate::consumer::{EventConsumer, JsonDecoder};
    pub use crate::dispatcher::{Dispatcher, DispatchOutcome};
    pub use crate::handler::{EventHandler, HandlerError};
    pub use crate::memory::*;
    pub use crate::producer::EventProducer;
    pub use crate::{
        ConnectionRegistry, IngestionWriter, NotificationBroadcaster, SearchIndexer,
        ThumbnailGenerator,
    };
    pub use async_trait::async_trait;
}
