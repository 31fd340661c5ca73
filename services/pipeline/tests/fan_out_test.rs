use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pixcast_pipeline::memory::*;
use pixcast_pipeline::{
    ChangeEvent, ConnectionRegistry, ConnectionStore, Dispatcher, EventHandler, ImageRecord,
    IngestError, IngestionWriter, NotificationBroadcaster, ObjectCreatedEvent, RetryConfig,
    SearchIndexer, ThumbnailGenerator, Topic,
};
use serde_json::{json, Map, Value};
use std::io::Cursor;
use std::sync::Arc;

fn retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
        invocation_timeout_ms: 1_000,
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([10, 120, 220]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn record(image_id: &str) -> ImageRecord {
    ImageRecord {
        group_id: "g1".to_string(),
        image_id: image_id.to_string(),
        timestamp: "2024-01-15T10:30:45.123Z".to_string(),
        display_name: Some(json!("Sunset")),
        image_url: None,
        attributes: Map::new(),
    }
}

fn notification(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).unwrap()
}

/// Every component wired over in-memory stores, the way a single-process
/// deployment runs them.
struct Harness {
    sources: Arc<MemoryBlobStore>,
    derivatives: Arc<MemoryBlobStore>,
    images: Arc<MemoryImageStore>,
    search: Arc<MemorySearchBackend>,
    connections: Arc<MemoryConnectionStore>,
    transport: Arc<MemoryPushTransport>,
    dead_letters: Arc<MemoryDeadLetterSink>,
    registry: Arc<ConnectionRegistry>,
    indexer: Arc<SearchIndexer>,
    broadcaster: Arc<NotificationBroadcaster>,
    thumbnails: Arc<ThumbnailGenerator>,
    dispatcher: Arc<Dispatcher>,
    objects: Topic<ObjectCreatedEvent>,
    writer: IngestionWriter,
}

impl Harness {
    fn new() -> Self {
        let sources = Arc::new(MemoryBlobStore::new());
        let derivatives = Arc::new(MemoryBlobStore::new());
        let images = Arc::new(MemoryImageStore::new());
        let search = Arc::new(MemorySearchBackend::new());
        let connections = Arc::new(MemoryConnectionStore::new());
        let transport = Arc::new(MemoryPushTransport::new());
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let dispatcher = Arc::new(Dispatcher::new(retry(), dead_letters.clone()));

        let registry = Arc::new(ConnectionRegistry::new(connections.clone()));
        let indexer = Arc::new(SearchIndexer::new(search.clone()));
        let broadcaster = Arc::new(NotificationBroadcaster::new(
            registry.clone(),
            transport.clone(),
        ));
        let thumbnails = Arc::new(
            ThumbnailGenerator::new(sources.clone(), derivatives.clone())
                .with_key_prefix("thumbnails/"),
        );

        let changes = Arc::new(Topic::<ChangeEvent>::new("image-changes", dispatcher.clone()));
        changes.subscribe(indexer.clone());
        changes.subscribe(broadcaster.clone());

        let objects = Topic::<ObjectCreatedEvent>::new("objects-created", dispatcher.clone());
        objects.subscribe(thumbnails.clone());

        let groups = Arc::new(MemoryGroupStore::with_groups(["g1"]));
        let writer = IngestionWriter::new(groups, images.clone(), changes);

        Self {
            sources,
            derivatives,
            images,
            search,
            connections,
            transport,
            dead_letters,
            registry,
            indexer,
            broadcaster,
            thumbnails,
            dispatcher,
            objects,
            writer,
        }
    }

    async fn connect(&self, ids: &[&str]) {
        for id in ids {
            self.registry.on_connect(id).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_end_to_end_upload() {
    let h = Harness::new();
    h.connect(&["X", "Y"]).await;

    let mut payload = Map::new();
    payload.insert("displayName".to_string(), json!("Sunset"));
    let created = h.writer.create_image("g1", payload).await.unwrap();

    // Record persisted with generated id and timestamp
    let stored = h.images.find(&created.image_id).expect("record persisted");
    assert_eq!(stored.group_id, "g1");
    assert_eq!(stored.timestamp, created.timestamp);

    // Client uploads the object under the image id
    h.sources.insert(created.image_id.clone(), png(300, 200));
    let deliveries = h
        .objects
        .publish(&ObjectCreatedEvent::new("images", created.image_id.clone()))
        .await;
    assert!(deliveries.iter().all(|d| d.outcome.is_delivered()));

    let derivative_key = format!("thumbnails/{}", created.image_id);
    assert!(h.derivatives.object(&derivative_key).is_some());

    let document = h.search.document(&created.image_id).expect("indexed");
    assert_eq!(document.group_id, "g1");
    assert_eq!(document.display_name, Some(json!("Sunset")));

    let expected = json!({"type": "imageCreated", "groupId": "g1", "imageId": created.image_id});
    for id in ["X", "Y"] {
        let received = h.transport.delivered_to(id);
        assert_eq!(received.len(), 1, "connection {id}");
        assert_eq!(notification(&received[0]), expected);
    }

    assert!(h.dead_letters.letters().is_empty());
}

#[tokio::test]
async fn test_unknown_group_short_circuits() {
    let h = Harness::new();
    h.connect(&["X"]).await;

    let err = h.writer.create_image("nope", Map::new()).await.unwrap_err();

    assert!(matches!(err, IngestError::GroupNotFound(_)));
    assert!(h.images.records().is_empty());
    assert!(h.search.is_empty());
    assert!(h.transport.delivered().is_empty());
}

#[tokio::test]
async fn test_redelivered_change_indexes_once() {
    let h = Harness::new();
    let event = ChangeEvent::insert(&record("i1"));

    h.indexer.handle(&event).await.unwrap();
    let first = h.search.document("i1");
    h.indexer.handle(&event).await.unwrap();

    assert_eq!(h.search.len(), 1);
    assert_eq!(h.search.document("i1"), first);
}

#[tokio::test]
async fn test_repeated_thumbnail_is_identical() {
    let h = Harness::new();
    h.sources.insert("i1", png(640, 480));
    let event = ObjectCreatedEvent::new("images", "i1");

    h.thumbnails.handle(&event).await.unwrap();
    let first = h.derivatives.object("thumbnails/i1").unwrap();
    h.thumbnails.handle(&event).await.unwrap();
    let second = h.derivatives.object("thumbnails/i1").unwrap();

    assert_eq!(h.derivatives.keys(), vec!["thumbnails/i1".to_string()]);
    assert_eq!(h.derivatives.put_count(), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_broadcast_prunes_gone_connection() {
    let h = Harness::new();
    h.connect(&["A", "B", "C"]).await;
    h.transport.mark_gone("B");

    h.broadcaster
        .handle(&ChangeEvent::insert(&record("i1")))
        .await
        .unwrap();

    let mut remaining = h.connections.scan_connections().await.unwrap();
    remaining.sort();
    assert_eq!(remaining, vec!["A".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn test_subscriber_order_does_not_matter() {
    let event = ChangeEvent::insert(&record("i1"));

    let forward = Harness::new();
    forward.connect(&["X", "Y"]).await;
    forward.indexer.handle(&event).await.unwrap();
    forward.broadcaster.handle(&event).await.unwrap();

    let reverse = Harness::new();
    reverse.connect(&["X", "Y"]).await;
    reverse.broadcaster.handle(&event).await.unwrap();
    reverse.indexer.handle(&event).await.unwrap();

    assert_eq!(forward.search.document("i1"), reverse.search.document("i1"));

    let notified = |h: &Harness| {
        let mut ids: Vec<String> = h.transport.delivered().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        ids
    };
    assert_eq!(notified(&forward), notified(&reverse));
}

#[tokio::test]
async fn test_missing_image_id_is_dead_lettered_once() {
    let h = Harness::new();
    let event: ChangeEvent = serde_json::from_value(json!({
        "operation": "insert",
        "newImage": {"groupId": "g1", "timestamp": "2024-01-15T10:30:45.123Z"}
    }))
    .unwrap();

    let outcome = h.dispatcher.dispatch(h.indexer.as_ref(), &event).await;

    assert!(!outcome.is_delivered());
    let letters = h.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].handler, "search-indexer");
    assert_eq!(letters[0].attempts, 1);
    assert!(letters[0].permanent);
    assert!(h.search.is_empty());
}

#[tokio::test]
async fn test_corrupt_upload_is_dead_lettered_without_blocking_others() {
    let h = Harness::new();
    h.sources.insert("broken", b"not an image".to_vec());
    h.sources.insert("ok", png(300, 300));

    h.objects
        .publish(&ObjectCreatedEvent::new("images", "broken"))
        .await;
    h.objects.publish(&ObjectCreatedEvent::new("images", "ok")).await;

    assert_eq!(h.dead_letters.letters().len(), 1);
    assert_eq!(h.dead_letters.letters()[0].handler, "thumbnail-generator");
    assert!(h.derivatives.object("thumbnails/ok").is_some());
}

/// Notifications are not scoped to the event's group: a client that only
/// cares about another group still receives the signal. Kept as-is; clients
/// filter on `groupId`.
#[tokio::test]
async fn test_broadcast_reaches_connections_of_other_groups() {
    let h = Harness::new();
    h.connect(&["viewing-g1", "viewing-g2"]).await;

    h.broadcaster
        .handle(&ChangeEvent::insert(&record("i1")))
        .await
        .unwrap();

    assert_eq!(h.transport.delivered_to("viewing-g1").len(), 1);
    assert_eq!(h.transport.delivered_to("viewing-g2").len(), 1);
}
