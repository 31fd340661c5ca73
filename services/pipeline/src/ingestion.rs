//! Write path that creates image records and starts the change feed.

use crate::model::{ChangeEvent, ImageRecord, RESERVED_FIELDS};
use crate::relay::OutboxRelay;
use crate::store::{ChangeFeedPublisher, GroupStore, ImageStore, PendingChange, StoreError};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Group does not exist: {0}")]
    GroupNotFound(String),

    #[error("Invalid image payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates the group, persists a new record and publishes its insert event.
///
/// An unknown group short-circuits before anything is written, so no record
/// and no downstream event exist for it. The insert event is queued in the
/// same write as the record; if the feed is down the relay publishes it later.
pub struct IngestionWriter {
    groups: Arc<dyn GroupStore>,
    images: Arc<dyn ImageStore>,
    relay: Arc<OutboxRelay>,
}

impl IngestionWriter {
    pub fn new(
        groups: Arc<dyn GroupStore>,
        images: Arc<dyn ImageStore>,
        feed: Arc<dyn ChangeFeedPublisher>,
    ) -> Self {
        let relay = Arc::new(OutboxRelay::new(images.clone(), feed));
        Self {
            groups,
            images,
            relay,
        }
    }

    /// Relay for changes whose immediate publish failed
    pub fn relay(&self) -> Arc<OutboxRelay> {
        self.relay.clone()
    }

    #[instrument(skip(self, payload))]
    pub async fn create_image(
        &self,
        group_id: &str,
        payload: Map<String, Value>,
    ) -> Result<ImageRecord, IngestError> {
        if !self.groups.group_exists(group_id).await? {
            warn!("Rejecting upload for unknown group");
            metrics::counter!("pipeline.ingest.rejected").increment(1);
            return Err(IngestError::GroupNotFound(group_id.to_string()));
        }

        let record = build_record(group_id, Uuid::new_v4().to_string(), now_iso8601(), payload)?;
        let change = PendingChange::new(ChangeEvent::insert(&record));

        self.images.put_image(&record, &change).await?;

        metrics::counter!("pipeline.ingest.created").increment(1);
        info!(image_id = %record.image_id, timestamp = %record.timestamp, "Image record created");

        if let Err(e) = self.relay.publish(&change).await {
            warn!(
                image_id = %record.image_id,
                error = %e,
                "Change feed publish deferred to outbox relay"
            );
            metrics::counter!("pipeline.ingest.publish_deferred").increment(1);
        }

        Ok(record)
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-01-15T10:30:45.123Z`
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn build_record(
    group_id: &str,
    image_id: String,
    timestamp: String,
    mut payload: Map<String, Value>,
) -> Result<ImageRecord, IngestError> {
    for field in RESERVED_FIELDS {
        payload.remove(field);
    }

    payload.insert("groupId".to_string(), Value::String(group_id.to_string()));
    payload.insert("imageId".to_string(), Value::String(image_id));
    payload.insert("timestamp".to_string(), Value::String(timestamp));

    ImageRecord::from_fields(payload).map_err(IngestError::InvalidPayload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryGroupStore, MemoryImageStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingFeed {
        down: Mutex<bool>,
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeFeedPublisher for RecordingFeed {
        async fn publish_change(&self, event: &ChangeEvent) -> Result<(), StoreError> {
            if *self.down.lock() {
                return Err(StoreError::Unavailable("kafka down".to_string()));
            }
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn writer() -> (IngestionWriter, Arc<MemoryImageStore>, Arc<RecordingFeed>) {
        let groups = Arc::new(MemoryGroupStore::with_groups(["g1"]));
        let images = Arc::new(MemoryImageStore::new());
        let feed = Arc::new(RecordingFeed::default());
        let writer = IngestionWriter::new(groups, images.clone(), feed.clone());
        (writer, images, feed)
    }

    #[test]
    fn test_timestamp_format() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'), "{ts}");
        assert_eq!(ts.len(), "2024-01-15T10:30:45.123Z".len());
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[tokio::test]
    async fn test_creates_record_and_publishes_insert() {
        let (writer, images, feed) = writer();

        let record = writer
            .create_image("g1", payload(json!({"displayName": "Sunset", "tags": ["sky"]})))
            .await
            .unwrap();

        assert_eq!(record.group_id, "g1");
        assert_eq!(record.display_name, Some(json!("Sunset")));
        assert_eq!(record.attributes.get("tags"), Some(&json!(["sky"])));
        assert!(Uuid::parse_str(&record.image_id).is_ok());

        assert_eq!(images.find(&record.image_id), Some(record.clone()));

        let events = feed.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record().unwrap(), record);
        assert!(images.pending().is_empty());
    }

    #[tokio::test]
    async fn test_feed_outage_leaves_change_queued_for_relay() {
        let (writer, images, feed) = writer();
        *feed.down.lock() = true;

        let record = writer
            .create_image("g1", payload(json!({"displayName": "Sunset"})))
            .await
            .unwrap();

        assert!(images.find(&record.image_id).is_some());
        assert!(feed.events.lock().is_empty());
        let pending = images.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.record().unwrap(), record);

        *feed.down.lock() = false;
        assert_eq!(writer.relay().drain().await.unwrap(), 1);

        let events = feed.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record().unwrap().image_id, record.image_id);
        assert!(images.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_group_writes_nothing() {
        let (writer, images, feed) = writer();

        let err = writer
            .create_image("missing", payload(json!({"displayName": "x"})))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::GroupNotFound(ref id) if id == "missing"));
        assert!(images.records().is_empty());
        assert!(feed.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_generated_fields_override_caller_values() {
        let (writer, _, _) = writer();

        let record = writer
            .create_image(
                "g1",
                payload(json!({"groupId": "other", "imageId": "mine", "timestamp": "yesterday"})),
            )
            .await
            .unwrap();

        assert_eq!(record.group_id, "g1");
        assert_ne!(record.image_id, "mine");
        assert_ne!(record.timestamp, "yesterday");
        assert!(record.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_known_fields_of_any_type_pass_through() {
        let (writer, images, feed) = writer();

        let record = writer
            .create_image("g1", payload(json!({"displayName": 42, "imageUrl": {"href": "x"}})))
            .await
            .unwrap();

        assert_eq!(record.display_name, Some(json!(42)));
        assert_eq!(record.image_url, Some(json!({"href": "x"})));
        assert!(images.find(&record.image_id).is_some());
        assert_eq!(feed.events.lock()[0].record().unwrap(), record);
    }
}
