//! In-memory implementations of every pipeline capability.
//!
//! Used by tests and single-process setups. They follow the same contracts
//! as the durable adapters: per-key last-write-wins, scans with no ordering
//! guarantee, and a record written together with its outbox entry.

use crate::dispatcher::{DeadLetter, DeadLetterSink};
use crate::model::{ImageRecord, SearchDocument};
use crate::store::{
    BlobStore, ConnectionStore, GroupStore, ImageStore, PendingChange, PushError, PushTransport,
    SearchBackend, StoreError,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
    puts: Mutex<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects
            .write()
            .insert(key.into(), (bytes, "application/octet-stream".to_string()));
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().get(key).map(|(bytes, _)| bytes.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Number of `put` calls, including overwrites
    pub fn put_count(&self) -> u64 {
        *self.puts.lock()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(format!("object {key}")))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.objects
            .write()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        *self.puts.lock() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryGroupStore {
    groups: RwLock<HashSet<String>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: RwLock::new(groups.into_iter().map(Into::into).collect()),
        }
    }

    pub fn add_group(&self, group_id: impl Into<String>) {
        self.groups.write().insert(group_id.into());
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError> {
        Ok(self.groups.read().contains(group_id))
    }
}

/// Image records keyed by `(group_id, timestamp)`, plus the change outbox
#[derive(Default)]
pub struct MemoryImageStore {
    images: RwLock<HashMap<(String, String), ImageRecord>>,
    outbox: Mutex<Vec<PendingChange>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.images.read().values().cloned().collect()
    }

    pub fn find(&self, image_id: &str) -> Option<ImageRecord> {
        self.images
            .read()
            .values()
            .find(|record| record.image_id == image_id)
            .cloned()
    }

    /// Changes not yet marked published, in write order
    pub fn pending(&self) -> Vec<PendingChange> {
        self.outbox.lock().clone()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn put_image(
        &self,
        record: &ImageRecord,
        change: &PendingChange,
    ) -> Result<(), StoreError> {
        let key = (record.group_id.clone(), record.timestamp.clone());
        let mut images = self.images.write();

        if images.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "image at {}/{} already exists",
                record.group_id, record.timestamp
            )));
        }

        // Both writes happen under the images lock
        self.outbox.lock().push(change.clone());
        images.insert(key, record.clone());
        Ok(())
    }

    async fn pending_changes(&self, limit: usize) -> Result<Vec<PendingChange>, StoreError> {
        Ok(self.outbox.lock().iter().take(limit).cloned().collect())
    }

    async fn mark_published(&self, change_id: &str) -> Result<(), StoreError> {
        self.outbox
            .lock()
            .retain(|change| change.change_id != change_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySearchBackend {
    documents: RwLock<HashMap<String, SearchDocument>>,
}

impl MemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, image_id: &str) -> Option<SearchDocument> {
        self.documents.read().get(image_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl SearchBackend for MemorySearchBackend {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), StoreError> {
        self.documents
            .write()
            .insert(document.image_id.clone(), document.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashSet<String>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().contains(connection_id)
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn put_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.connections.write().insert(connection_id.to_string());
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.connections.write().remove(connection_id);
        Ok(())
    }

    async fn scan_connections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.connections.read().iter().cloned().collect())
    }
}

/// Transport that records deliveries and fails on demand.
#[derive(Default)]
pub struct MemoryPushTransport {
    gone: RwLock<HashSet<String>>,
    failing: RwLock<HashSet<String>>,
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes to this connection report [`PushError::Gone`]
    pub fn mark_gone(&self, connection_id: impl Into<String>) {
        self.gone.write().insert(connection_id.into());
    }

    /// Pushes to this connection report [`PushError::Other`]
    pub fn mark_failing(&self, connection_id: impl Into<String>) {
        self.failing.write().insert(connection_id.into());
    }

    pub fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().clone()
    }

    pub fn delivered_to(&self, connection_id: &str) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl PushTransport for MemoryPushTransport {
    async fn send(&self, connection_id: &str, payload: &[u8]) -> Result<(), PushError> {
        if self.gone.read().contains(connection_id) {
            return Err(PushError::Gone);
        }
        if self.failing.read().contains(connection_id) {
            return Err(PushError::Other("connection reset".to_string()));
        }

        self.delivered
            .lock()
            .push((connection_id.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    unavailable: RwLock<bool>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// While set, every write fails with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        if *self.unavailable.read() {
            return Err(StoreError::Unavailable("dead-letter sink offline".to_string()));
        }
        self.letters.lock().push(letter);
        Ok(())
    }
}
