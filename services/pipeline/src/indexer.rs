//! Search sync for the image change feed.

use crate::handler::{EventHandler, HandlerError};
use crate::model::{ChangeEvent, SearchDocument};
use crate::store::SearchBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Upserts one search document per inserted image.
///
/// Documents are keyed by image id and fully replaced on every write, so a
/// redelivered event leaves the index unchanged.
pub struct SearchIndexer {
    backend: Arc<dyn SearchBackend>,
}

impl SearchIndexer {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl EventHandler<ChangeEvent> for SearchIndexer {
    fn name(&self) -> &'static str {
        "search-indexer"
    }

    #[instrument(skip(self, event), fields(operation = ?event.operation))]
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        if !event.is_insert() {
            debug!("Skipping non-insert change");
            return Ok(());
        }

        let record = event.record().map_err(HandlerError::Permanent)?;
        let document = SearchDocument::from(record);

        self.backend.upsert(&document).await?;

        metrics::counter!("pipeline.search.indexed").increment(1);
        info!(image_id = %document.image_id, group_id = %document.group_id, "Search document upserted");

        Ok(())
    }
}
