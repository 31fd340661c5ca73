use crate::config::WorkerConfig;
use pixcast_pipeline::{
    BlobStore, ChangeEvent, ConnectionRegistry, ConsumerError, Dispatcher, EventConsumer,
    EventHandler, IncomingMessage, JsonDecoder, KafkaConfig, MessageDecoder,
    NotificationBroadcaster, ObjectCreatedEvent, PushTransport, SearchBackend, SearchIndexer,
    ThumbnailGenerator,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Backends the pipeline handlers write to
pub struct WorkerDeps {
    pub images: Arc<dyn BlobStore>,
    pub thumbnails: Arc<dyn BlobStore>,
    pub thumbnail_key_prefix: String,
    pub search: Arc<dyn SearchBackend>,
    pub registry: Arc<ConnectionRegistry>,
    pub push: Arc<dyn PushTransport>,
}

/// Running subscriber consumers, one consumer group each
pub struct PipelineWorkers {
    cancel: CancellationToken,
    failed: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineWorkers {
    /// Subscribe every enabled handler to its feed and start consuming.
    pub fn spawn(
        kafka: &KafkaConfig,
        workers: &WorkerConfig,
        dispatcher: Arc<Dispatcher>,
        deps: WorkerDeps,
    ) -> Result<Self, ConsumerError> {
        let mut pool = Self {
            cancel: CancellationToken::new(),
            failed: CancellationToken::new(),
            handles: Vec::new(),
        };

        if workers.thumbnails_enabled {
            let generator = ThumbnailGenerator::new(deps.images.clone(), deps.thumbnails.clone())
                .with_target_width(workers.thumbnail_width)
                .with_key_prefix(deps.thumbnail_key_prefix.clone());
            pool.start::<ObjectCreatedEvent, _, _>(
                kafka,
                &kafka.topics.object_created,
                Arc::new(generator),
                dispatcher.clone(),
                |message: &IncomingMessage| ObjectCreatedEvent::decode_all(&message.payload),
            )?;
        }

        if workers.search_enabled {
            pool.start::<ChangeEvent, _, _>(
                kafka,
                &kafka.topics.image_changes,
                Arc::new(SearchIndexer::new(deps.search.clone())),
                dispatcher.clone(),
                JsonDecoder,
            )?;
        }

        if workers.notifications_enabled {
            let broadcaster =
                NotificationBroadcaster::new(deps.registry.clone(), deps.push.clone())
                    .with_concurrency(workers.broadcast_concurrency);
            pool.start::<ChangeEvent, _, _>(
                kafka,
                &kafka.topics.image_changes,
                Arc::new(broadcaster),
                dispatcher,
                JsonDecoder,
            )?;
        }

        if pool.handles.is_empty() {
            warn!("All pipeline workers are disabled");
        }

        Ok(pool)
    }

    fn start<E, H, D>(
        &mut self,
        kafka: &KafkaConfig,
        topic: &str,
        handler: Arc<H>,
        dispatcher: Arc<Dispatcher>,
        decoder: D,
    ) -> Result<(), ConsumerError>
    where
        E: Serialize + Send + Sync + 'static,
        H: EventHandler<E> + 'static,
        D: MessageDecoder<E> + 'static,
    {
        let subscriber = handler.name();
        let consumer = Arc::new(EventConsumer::new(kafka, subscriber, topic)?);

        let stopper = consumer.clone();
        let token = self.cancel.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            stopper.shutdown();
        });

        let failed = self.failed.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = consumer.run(handler, dispatcher, decoder).await {
                error!(subscriber, error = %e, "Pipeline worker stopped with error");
                failed.cancel();
            }
        });

        info!(subscriber, topic, "Pipeline worker started");
        self.handles.push((subscriber, handle));
        Ok(())
    }

    pub fn subscribers(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Resolves once any worker has stopped on an error. Its uncommitted
    /// messages are redelivered to the group after a restart.
    pub async fn failed(&self) {
        self.failed.cancelled().await;
    }

    /// Stop consuming and wait for in-flight messages to be committed.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();

        for (subscriber, handle) in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => info!(subscriber, "Pipeline worker stopped"),
                Ok(Err(e)) => error!(subscriber, error = %e, "Pipeline worker panicked"),
                Err(_) => warn!(subscriber, "Pipeline worker did not stop in time"),
            }
        }
    }
}
