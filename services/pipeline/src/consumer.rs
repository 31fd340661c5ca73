//! Kafka subscription loop for pipeline handlers.
//!
//! One [`EventConsumer`] is one subscriber: its own consumer group on one
//! topic, so every subscriber of a topic sees every message. Offsets are
//! committed only after the dispatcher has finished with a message, which
//! makes delivery at-least-once. A message that can be neither handled nor
//! dead-lettered stops the consumer uncommitted, so the group redelivers it.

use crate::config::KafkaConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::handler::EventHandler;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Message at {partition}/{offset} could not be handled or dead-lettered: {reason}")]
    Undeliverable {
        partition: i32,
        offset: i64,
        reason: String,
    },
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>, String> {
        serde_json::from_slice(&self.payload)
            .map(|event| vec![event])
            .map_err(|e| e.to_string())
    }

    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }
}

/// Turns one message into zero or more events.
///
/// A single S3 notification can carry several records, so decoders return a
/// list. An `Err` means the payload can never be processed.
pub trait MessageDecoder<E>: Send + Sync {
    fn decode(&self, message: &IncomingMessage) -> Result<Vec<E>, String>;
}

impl<E, F> MessageDecoder<E> for F
where
    F: Fn(&IncomingMessage) -> Result<Vec<E>, String> + Send + Sync,
{
    fn decode(&self, message: &IncomingMessage) -> Result<Vec<E>, String> {
        self(message)
    }
}

/// Decodes the payload as a single JSON event
pub struct JsonDecoder;

impl<E: serde::de::DeserializeOwned> MessageDecoder<E> for JsonDecoder {
    fn decode(&self, message: &IncomingMessage) -> Result<Vec<E>, String> {
        message.decode_json()
    }
}

/// One subscriber's consumer group on one topic
pub struct EventConsumer {
    consumer: StreamConsumer,
    subscriber: String,
    topic: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventConsumer {
    pub fn new(config: &KafkaConfig, subscriber: &str, topic: &str) -> Result<Self, ConsumerError> {
        let group_id = config.subscriber_group(subscriber);
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %group_id,
            topic,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config(subscriber)
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::SubscriptionError {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            subscriber: subscriber.to_string(),
            topic: topic.to_string(),
            shutdown_tx,
        })
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Signal the consumption loop to stop after the current message
    pub fn shutdown(&self) {
        info!(subscriber = %self.subscriber, "Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    fn commit(&self, mode: CommitMode) -> Result<(), ConsumerError> {
        self.consumer
            .commit_consumer_state(mode)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }

    /// Consume until shutdown, dispatching every decoded event to `handler`.
    #[instrument(skip_all, fields(subscriber = %self.subscriber, topic = %self.topic))]
    pub async fn run<E, H, D>(
        &self,
        handler: Arc<H>,
        dispatcher: Arc<Dispatcher>,
        decoder: D,
    ) -> Result<(), ConsumerError>
    where
        E: Serialize + Send + Sync,
        H: EventHandler<E> + ?Sized,
        D: MessageDecoder<E>,
    {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);
                            drop(borrowed_message);

                            if let Err(e) = process_message(
                                &self.subscriber,
                                handler.as_ref(),
                                &dispatcher,
                                &decoder,
                                incoming,
                            )
                            .await
                            {
                                error!(error = %e, "Stopping consumer without committing");
                                metrics::counter!("pipeline.consumer.halted", "subscriber" => self.subscriber.clone())
                                    .increment(1);
                                return Err(e);
                            }

                            if let Err(e) = self.commit(CommitMode::Async) {
                                warn!(error = %e, "Failed to commit offsets asynchronously");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                            metrics::counter!("pipeline.consumer.errors").increment(1);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.commit(CommitMode::Sync) {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }
}

/// Decode one message and dispatch each event it carries.
///
/// Returns an error only when an event (or the undecodable payload) could not
/// be parked in the dead-letter sink; the offset must not be committed then.
async fn process_message<E, H, D>(
    subscriber: &str,
    handler: &H,
    dispatcher: &Dispatcher,
    decoder: &D,
    message: IncomingMessage,
) -> Result<(), ConsumerError>
where
    E: Serialize + Send + Sync,
    H: EventHandler<E> + ?Sized,
    D: MessageDecoder<E>,
{
    let partition = message.metadata.partition;
    let offset = message.metadata.offset;

    debug!(
        partition,
        offset,
        key = ?message.key_str(),
        message_type = ?message.header("message-type"),
        "Received message"
    );
    metrics::counter!("pipeline.consumer.received", "subscriber" => subscriber.to_string())
        .increment(1);

    let events = match decoder.decode(&message) {
        Ok(events) => events,
        Err(reason) => {
            warn!(partition, offset, error = %reason, "Undecodable message");
            metrics::counter!("pipeline.consumer.undecodable", "subscriber" => subscriber.to_string())
                .increment(1);
            return dispatcher
                .dead_letter_raw(handler.name(), &message.payload, &reason)
                .await
                .map_err(|e| ConsumerError::Undeliverable {
                    partition,
                    offset,
                    reason: format!("{reason}; dead-letter sink: {e}"),
                });
        }
    };

    for event in &events {
        if let DispatchOutcome::Undeliverable {
            reason, sink_error, ..
        } = dispatcher.dispatch(handler, event).await
        {
            return Err(ConsumerError::Undeliverable {
                partition,
                offset,
                reason: format!("{reason}; dead-letter sink: {sink_error}"),
            });
        }
    }

    Ok(())
}

fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}
