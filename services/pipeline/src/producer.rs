//! Kafka producer for pipeline feeds and the dead-letter topic.

use crate::config::{KafkaConfig, TopicConfig};
use crate::dispatcher::{DeadLetter, DeadLetterSink};
use crate::model::ChangeEvent;
use crate::store::{ChangeFeedPublisher, StoreError};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

impl From<ProducerError> for StoreError {
    fn from(err: ProducerError) -> Self {
        match err {
            ProducerError::SerializationError(message) => StoreError::Rejected(message),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key; messages with the same key keep their order
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value),
                })
            })
    }
}

pub struct EventProducer {
    producer: FutureProducer,
    topics: TopicConfig,
    default_timeout: Duration,
}

impl EventProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(bootstrap_servers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            topics: config.topics,
            default_timeout,
        })
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");
        metrics::counter!("pipeline.producer.sent", "topic" => message.topic.clone()).increment(1);

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
            key: message.key,
        })
    }

    /// Publish a change event keyed by group id, so changes within a group
    /// land on one partition in order.
    pub async fn send_change(&self, event: &ChangeEvent) -> Result<DeliveryResult, ProducerError> {
        let mut message = OutgoingMessage::new_json(&self.topics.image_changes, event)?
            .with_message_type("image_change");

        if let Some(group_id) = event.group_id() {
            message = message.with_key(group_id);
        }

        self.send(message).await
    }

    pub async fn send_to_dlq(&self, letter: &DeadLetter) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::new_json(&self.topics.dead_letter_queue, letter)?
            .with_key(Uuid::new_v4().to_string())
            .with_message_type("dead_letter")
            .with_header("handler", letter.handler.as_str())
            .with_header("error-reason", letter.reason.as_str());

        self.send(message).await
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[async_trait]
impl ChangeFeedPublisher for EventProducer {
    async fn publish_change(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        self.send_change(event).await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for EventProducer {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        self.send_to_dlq(&letter).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new_json("pixcast.dlq", &serde_json::json!({"a": 1}))
            .unwrap()
            .with_key("g1")
            .with_message_type("dead_letter")
            .with_header("handler", "search-indexer");

        assert_eq!(message.key.as_deref(), Some("g1"));
        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.payload, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn test_send_failures_are_transient_store_errors() {
        let err: StoreError = ProducerError::SendError {
            topic: "pixcast.images.changes".to_string(),
            message: "broker down".to_string(),
        }
        .into();
        assert!(err.is_transient());

        let err: StoreError = ProducerError::SerializationError("bad".to_string()).into();
        assert!(!err.is_transient());
    }
}
