//! Fan-out of image notifications to connected clients.

use crate::handler::{EventHandler, HandlerError};
use crate::model::{ChangeEvent, ImageNotification};
use crate::registry::ConnectionRegistry;
use crate::store::{PushError, PushTransport};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default number of pushes in flight per event
pub const DEFAULT_BROADCAST_CONCURRENCY: usize = 16;

/// Per-event delivery tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
    pub failed: usize,
}

enum PushOutcome {
    Delivered,
    Pruned,
    Failed,
}

/// Pushes a refetch signal for every inserted image to every registered
/// connection.
///
/// Delivery is best effort. Connections the transport reports as gone are
/// removed from the registry; other failures are logged and skipped. A
/// single broken connection never fails the event.
///
/// Every connection is notified regardless of the event's group, so clients
/// filter on `groupId` themselves.
pub struct NotificationBroadcaster {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn PushTransport>,
    concurrency: usize,
}

impl NotificationBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            registry,
            transport,
            concurrency: DEFAULT_BROADCAST_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Push `notification` to every listed connection.
    pub async fn broadcast(
        &self,
        notification: &ImageNotification,
    ) -> Result<BroadcastReport, HandlerError> {
        let payload = serde_json::to_vec(notification)
            .map_err(|e| HandlerError::Permanent(format!("cannot encode notification: {e}")))?;

        let connections = self
            .registry
            .list_active()
            .await
            .map_err(|e| HandlerError::Transient(format!("cannot list connections: {e}")))?;

        debug!(connections = connections.len(), "Broadcasting notification");

        let outcomes: Vec<PushOutcome> = stream::iter(connections)
            .map(|connection_id| {
                let payload = &payload;
                async move { self.push_one(&connection_id, payload).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BroadcastReport::default();
        for outcome in outcomes {
            match outcome {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Pruned => report.pruned += 1,
                PushOutcome::Failed => report.failed += 1,
            }
        }

        metrics::counter!("pipeline.broadcast.delivered").increment(report.delivered as u64);
        metrics::counter!("pipeline.broadcast.pruned").increment(report.pruned as u64);
        metrics::counter!("pipeline.broadcast.failed").increment(report.failed as u64);

        Ok(report)
    }

    async fn push_one(&self, connection_id: &str, payload: &[u8]) -> PushOutcome {
        match self.transport.send(connection_id, payload).await {
            Ok(()) => PushOutcome::Delivered,
            Err(PushError::Gone) => {
                debug!(connection_id, "Connection gone, pruning");
                if let Err(e) = self.registry.on_disconnect(connection_id).await {
                    warn!(connection_id, error = %e, "Failed to prune stale connection");
                }
                PushOutcome::Pruned
            }
            Err(PushError::Other(reason)) => {
                warn!(connection_id, error = %reason, "Push failed");
                PushOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl EventHandler<ChangeEvent> for NotificationBroadcaster {
    fn name(&self) -> &'static str {
        "notification-broadcaster"
    }

    #[instrument(skip(self, event), fields(operation = ?event.operation))]
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if !event.is_insert() {
            debug!("Skipping non-insert change");
            return Ok(());
        }

        let record = event.record().map_err(HandlerError::Permanent)?;
        let report = self
            .broadcast(&ImageNotification::image_created(&record))
            .await?;

        info!(
            image_id = %record.image_id,
            delivered = report.delivered,
            pruned = report.pruned,
            failed = report.failed,
            "Notification broadcast"
        );

        Ok(())
    }
}
