//! Live WebSocket connections on this gateway instance.

use async_trait::async_trait;
use parking_lot::RwLock;
use pixcast_pipeline::{PushError, PushTransport};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// Routes pushed payloads to the socket task that owns each connection id.
///
/// Ids are `{instance_id}:{uuid}`. An id minted by this instance that is not
/// in the map has no socket here and never will again, so pushes to it
/// report [`PushError::Gone`]. Ids of other instances are never answered
/// as gone.
pub struct ConnectionHub {
    instance_id: String,
    connections: RwLock<HashMap<String, UnboundedSender<String>>>,
}

impl ConnectionHub {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh connection id scoped to this instance
    pub fn mint_id(&self) -> String {
        format!("{}:{}", self.instance_id, Uuid::new_v4())
    }

    /// Whether `connection_id` was minted by this instance
    pub fn owns(&self, connection_id: &str) -> bool {
        connection_id
            .rsplit_once(':')
            .is_some_and(|(instance, _)| instance == self.instance_id)
    }

    /// Register a connection and return the receiving end of its outbox
    pub fn register(&self, connection_id: &str) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().insert(connection_id.to_string(), tx);
        metrics::gauge!("gateway.connections.active").set(self.len() as f64);
        rx
    }

    pub fn unregister(&self, connection_id: &str) -> bool {
        let removed = self.connections.write().remove(connection_id).is_some();
        metrics::gauge!("gateway.connections.active").set(self.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Queue a text frame for one connection.
    pub fn deliver(&self, connection_id: &str, text: String) -> Result<(), PushError> {
        if !self.owns(connection_id) {
            return Err(PushError::Other(format!(
                "connection {connection_id} belongs to another gateway instance"
            )));
        }

        let sender = self
            .connections
            .read()
            .get(connection_id)
            .cloned()
            .ok_or(PushError::Gone)?;

        if sender.send(text).is_err() {
            // Socket task already exited
            self.unregister(connection_id);
            return Err(PushError::Gone);
        }

        debug!(connection_id, "Queued push for connection");
        Ok(())
    }
}

#[async_trait]
impl PushTransport for ConnectionHub {
    async fn send(&self, connection_id: &str, payload: &[u8]) -> Result<(), PushError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| PushError::Other(format!("payload is not UTF-8: {e}")))?;
        self.deliver(connection_id, text.to_string())
    }
}
