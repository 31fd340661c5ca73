//! Set of live real-time connection ids.

use crate::handler::{EventHandler, HandlerError};
use crate::model::ConnectionEvent;
use crate::store::{ConnectionStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks which connection ids are currently reachable.
///
/// Both operations are idempotent: connecting twice stores the id once and
/// disconnecting an unknown id succeeds.
pub struct ConnectionRegistry {
    store: Arc<dyn ConnectionStore>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self { store }
    }

    pub async fn on_connect(&self, connection_id: &str) -> Result<(), StoreError> {
        self.store.put_connection(connection_id).await?;
        metrics::counter!("pipeline.connections.registered").increment(1);
        info!(connection_id, "Connection registered");
        Ok(())
    }

    pub async fn on_disconnect(&self, connection_id: &str) -> Result<(), StoreError> {
        self.store.delete_connection(connection_id).await?;
        metrics::counter!("pipeline.connections.removed").increment(1);
        info!(connection_id, "Connection removed");
        Ok(())
    }

    /// Snapshot of registered ids. May include connections that have already
    /// gone; pushes to those report [`crate::store::PushError::Gone`].
    pub async fn list_active(&self) -> Result<Vec<String>, StoreError> {
        let ids = self.store.scan_connections().await?;
        debug!(count = ids.len(), "Listed active connections");
        Ok(ids)
    }
}

#[async_trait]
impl EventHandler<ConnectionEvent> for ConnectionRegistry {
    fn name(&self) -> &'static str {
        "connection-registry"
    }

    async fn handle(&self, event: &ConnectionEvent) -> Result<(), HandlerError> {
        if event.connection_id().is_empty() {
            return Err(HandlerError::Permanent(
                "connection event without a connection id".to_string(),
            ));
        }

        match event {
            ConnectionEvent::Connected { connection_id } => self.on_connect(connection_id).await?,
            ConnectionEvent::Disconnected { connection_id } => {
                self.on_disconnect(connection_id).await?
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnectionStore;

    fn registry() -> (ConnectionRegistry, Arc<MemoryConnectionStore>) {
        let store = Arc::new(MemoryConnectionStore::new());
        (ConnectionRegistry::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (registry, _) = registry();

        registry.on_connect("a").await.unwrap();
        registry.on_connect("a").await.unwrap();

        assert_eq!(registry.list_active().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_id_succeeds() {
        let (registry, _) = registry();
        tokio_test::assert_ok!(registry.on_disconnect("never-seen").await);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let (registry, store) = registry();

        registry
            .handle(&ConnectionEvent::Connected {
                connection_id: "a".to_string(),
            })
            .await
            .unwrap();
        assert!(store.contains("a"));

        registry
            .handle(&ConnectionEvent::Disconnected {
                connection_id: "a".to_string(),
            })
            .await
            .unwrap();
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_empty_connection_id_is_permanent() {
        let (registry, _) = registry();

        let err = registry
            .handle(&ConnectionEvent::Connected {
                connection_id: String::new(),
            })
            .await
            .unwrap_err();

        assert!(err.is_permanent());
    }
}
