//! Moves queued change events from the image store's outbox onto the feed.
//!
//! A change is marked published only after the feed accepted it, so a crash
//! between the two steps publishes it again. Subscribers already tolerate
//! duplicates.

use crate::store::{ChangeFeedPublisher, ImageStore, PendingChange, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

const RELAY_BATCH_SIZE: usize = 100;

pub struct OutboxRelay {
    images: Arc<dyn ImageStore>,
    feed: Arc<dyn ChangeFeedPublisher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl OutboxRelay {
    pub fn new(images: Arc<dyn ImageStore>, feed: Arc<dyn ChangeFeedPublisher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            images,
            feed,
            shutdown_tx,
        }
    }

    /// Publish one queued change and remove it from the outbox.
    pub async fn publish(&self, change: &PendingChange) -> Result<(), StoreError> {
        self.feed.publish_change(&change.event).await?;
        self.images.mark_published(&change.change_id).await?;
        debug!(change_id = %change.change_id, "Change published");
        Ok(())
    }

    /// Publish everything pending, oldest first.
    ///
    /// Stops at the first failure so a later change never overtakes an
    /// earlier one that is still queued.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut published = 0;

        loop {
            let batch = self.images.pending_changes(RELAY_BATCH_SIZE).await?;
            let full = batch.len() == RELAY_BATCH_SIZE;

            for change in &batch {
                self.publish(change).await?;
                published += 1;
            }

            if !full {
                if published > 0 {
                    metrics::counter!("pipeline.relay.published").increment(published as u64);
                }
                return Ok(published);
            }
        }
    }

    pub fn shutdown(&self) {
        info!("Signaling outbox relay shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Drain the outbox every `interval` until shutdown.
    pub async fn run(&self, interval: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = interval.as_millis() as u64, "Outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => match self.drain().await {
                    Ok(0) => {}
                    Ok(published) => info!(published, "Relayed queued changes"),
                    Err(e) => {
                        warn!(error = %e, "Outbox relay stalled, retrying next tick");
                        metrics::counter!("pipeline.relay.failed").increment(1);
                    }
                },
            }
        }

        info!("Outbox relay stopped");
    }
}
