//! Domain types that flow through the ingestion fan-out.
//!
//! Everything here is a plain value: records persisted by the ingestion
//! writer, the change events the metadata feed carries, object-created
//! events from the blob store, and the payloads derived from them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields the ingestion writer generates; caller-supplied values are dropped.
pub const RESERVED_FIELDS: [&str; 3] = ["groupId", "imageId", "timestamp"];

/// One uploaded image.
///
/// `(group_id, timestamp)` is unique within the metadata store and
/// `image_id` is globally unique. Records are written once and never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Owning group
    pub group_id: String,
    /// Globally unique image id, also the object key of the upload
    pub image_id: String,
    /// ISO-8601 creation time, ordering key within a group
    pub timestamp: String,
    /// Caller-supplied display name, usually a string but never checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Value>,
    /// Caller-supplied image URL, passed through like `display_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
    /// Any other caller-supplied fields, passed through untouched
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ImageRecord {
    /// Build a record from a raw JSON object, rejecting missing or empty keys.
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, String> {
        let record: ImageRecord =
            serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())?;

        for (name, value) in [
            ("groupId", &record.group_id),
            ("imageId", &record.image_id),
            ("timestamp", &record.timestamp),
        ] {
            if value.trim().is_empty() {
                return Err(format!("field `{name}` is empty"));
            }
        }

        Ok(record)
    }
}

/// Kind of write a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "MODIFY")]
    Modify,
    #[serde(alias = "REMOVE")]
    Remove,
}

/// New state of an image record at the moment of a metadata-store write.
///
/// `new_image` is kept as a raw object so a malformed record reaches the
/// consumer (and the dead-letter sink) instead of failing at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    #[serde(default)]
    pub new_image: Option<Map<String, Value>>,
}

impl ChangeEvent {
    /// Insert event for a freshly persisted record.
    pub fn insert(record: &ImageRecord) -> Self {
        let new_image = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };

        Self {
            operation: ChangeOperation::Insert,
            new_image,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.operation == ChangeOperation::Insert
    }

    /// Validated image record carried by the event.
    pub fn record(&self) -> Result<ImageRecord, String> {
        let fields = self
            .new_image
            .clone()
            .ok_or_else(|| "change event has no newImage".to_string())?;
        ImageRecord::from_fields(fields)
    }

    /// Group id if present, used as the partition key on the feed.
    pub fn group_id(&self) -> Option<&str> {
        self.new_image
            .as_ref()
            .and_then(|image| image.get("groupId"))
            .and_then(Value::as_str)
    }
}

/// A new object landed in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCreatedEvent {
    /// Bucket or container id
    pub bucket: String,
    /// Object key, already URL-decoded
    pub key: String,
}

#[derive(Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Deserialize)]
struct S3Record {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Message")]
    message: String,
}

impl ObjectCreatedEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Decode an object-created payload.
    ///
    /// Accepts the plain `{bucket, key}` form, an S3 event notification (one
    /// event per record) or an SNS envelope wrapping an S3 notification.
    pub fn decode_all(payload: &[u8]) -> Result<Vec<Self>, String> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        Self::decode_value(value)
    }

    fn decode_value(value: Value) -> Result<Vec<Self>, String> {
        if value.get("Records").is_some() {
            let notification: S3Notification =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            return notification
                .records
                .into_iter()
                .map(|record| {
                    Ok(Self::new(
                        record.s3.bucket.name,
                        decode_object_key(&record.s3.object.key)?,
                    ))
                })
                .collect();
        }

        if value.get("Message").is_some() {
            let envelope: SnsEnvelope =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            let inner: Value =
                serde_json::from_str(&envelope.message).map_err(|e| e.to_string())?;
            return Self::decode_value(inner);
        }

        let event: ObjectCreatedEvent = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if event.key.is_empty() {
            return Err("object-created event has an empty key".to_string());
        }
        Ok(vec![event])
    }
}

/// S3 notifications URL-encode keys and use `+` for spaces.
fn decode_object_key(raw: &str) -> Result<String, String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| format!("invalid object key {raw:?}: {e}"))
}

/// Full-text projection of an image record, keyed by `image_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub image_id: String,
    pub group_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl From<ImageRecord> for SearchDocument {
    fn from(record: ImageRecord) -> Self {
        Self {
            image_id: record.image_id,
            group_id: record.group_id,
            timestamp: record.timestamp,
            display_name: record.display_name,
            image_url: record.image_url,
            attributes: record.attributes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationType {
    ImageCreated,
}

/// Refetch signal pushed to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageNotification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub group_id: String,
    pub image_id: String,
}

impl ImageNotification {
    pub fn image_created(record: &ImageRecord) -> Self {
        Self {
            kind: NotificationType::ImageCreated,
            group_id: record.group_id.clone(),
            image_id: record.image_id.clone(),
        }
    }
}

/// Connection lifecycle events raised by the real-time transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    #[serde(rename_all = "camelCase")]
    Disconnected { connection_id: String },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            ConnectionEvent::Connected { connection_id }
            | ConnectionEvent::Disconnected { connection_id } => connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ImageRecord {
        ImageRecord {
            group_id: "g1".to_string(),
            image_id: "i1".to_string(),
            timestamp: "2024-01-15T10:30:45.123Z".to_string(),
            display_name: Some(json!("Sunset")),
            image_url: None,
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_image_record_passes_through_unknown_fields() {
        let json = json!({
            "groupId": "g1",
            "imageId": "i1",
            "timestamp": "2024-01-15T10:30:45.123Z",
            "displayName": "Sunset",
            "camera": {"model": "X100"}
        });

        let record: ImageRecord = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(record.attributes.get("camera"), Some(&json!({"model": "X100"})));
        assert_eq!(serde_json::to_value(&record).unwrap(), json);
    }

    #[test]
    fn test_change_event_with_non_string_display_name_is_valid() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "operation": "insert",
            "newImage": {"groupId": "g1", "imageId": "i1", "timestamp": "t1", "displayName": 42}
        }))
        .unwrap();

        let record = event.record().unwrap();
        assert_eq!(record.display_name, Some(json!(42)));
        assert!(record.attributes.is_empty());
    }

    #[test]
    fn test_change_event_missing_image_id_is_rejected() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "operation": "insert",
            "newImage": {"groupId": "g1", "timestamp": "t1"}
        }))
        .unwrap();

        let err = event.record().unwrap_err();
        assert!(err.contains("imageId"), "unexpected error: {err}");
    }

    #[test]
    fn test_change_event_rejects_empty_fields() {
        let mut event = ChangeEvent::insert(&record());
        event
            .new_image
            .as_mut()
            .unwrap()
            .insert("imageId".to_string(), json!(""));

        assert!(event.record().is_err());
    }

    #[test]
    fn test_change_operation_accepts_stream_casing() {
        let event: ChangeEvent =
            serde_json::from_value(json!({"operation": "MODIFY", "newImage": null})).unwrap();
        assert_eq!(event.operation, ChangeOperation::Modify);
        assert!(!event.is_insert());
    }

    #[test]
    fn test_insert_event_carries_record() {
        let event = ChangeEvent::insert(&record());
        assert!(event.is_insert());
        assert_eq!(event.group_id(), Some("g1"));
        assert_eq!(event.record().unwrap(), record());
    }

    #[test]
    fn test_decode_plain_object_created() {
        let events =
            ObjectCreatedEvent::decode_all(br#"{"bucket":"images","key":"i1"}"#).unwrap();
        assert_eq!(events, vec![ObjectCreatedEvent::new("images", "i1")]);
    }

    #[test]
    fn test_decode_s3_notification_decodes_keys() {
        let payload = json!({
            "Records": [
                {"s3": {"bucket": {"name": "images"}, "object": {"key": "my+photo%281%29.jpg"}}},
                {"s3": {"bucket": {"name": "images"}, "object": {"key": "i2"}}}
            ]
        });

        let events = ObjectCreatedEvent::decode_all(payload.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "my photo(1).jpg");
        assert_eq!(events[1], ObjectCreatedEvent::new("images", "i2"));
    }

    #[test]
    fn test_decode_sns_envelope() {
        let inner = json!({
            "Records": [{"s3": {"bucket": {"name": "images"}, "object": {"key": "i9"}}}]
        });
        let payload = json!({"Type": "Notification", "Message": inner.to_string()});

        let events = ObjectCreatedEvent::decode_all(payload.to_string().as_bytes()).unwrap();
        assert_eq!(events, vec![ObjectCreatedEvent::new("images", "i9")]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ObjectCreatedEvent::decode_all(b"not json").is_err());
        assert!(ObjectCreatedEvent::decode_all(br#"{"bucket":"images","key":""}"#).is_err());
    }

    #[test]
    fn test_notification_wire_format() {
        let payload = ImageNotification::image_created(&record());
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"type": "imageCreated", "groupId": "g1", "imageId": "i1"})
        );
    }

    #[test]
    fn test_connection_event_wire_format() {
        let event = ConnectionEvent::Connected {
            connection_id: "c1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "connected", "connectionId": "c1"})
        );
        assert_eq!(event.connection_id(), "c1");
    }
}
