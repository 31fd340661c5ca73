use crate::config::SearchConfig;
use async_trait::async_trait;
use pixcast_pipeline::{SearchBackend, SearchDocument, StoreError};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// Elasticsearch-compatible document store over its REST API
pub struct ElasticsearchBackend {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticsearchBackend {
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
        })
    }

    /// `PUT {url}/{index}/_doc/{id}` replaces the whole document
    pub fn document_url(&self, image_id: &str) -> String {
        format!(
            "{}/{}/_doc/{}",
            self.base_url,
            self.index,
            urlencoding::encode(image_id)
        )
    }
}

/// Backend answers that are worth retrying
fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    #[instrument(skip(self, document), fields(image_id = %document.image_id, index = %self.index))]
    async fn upsert(&self, document: &SearchDocument) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.document_url(&document.image_id))
            .json(document)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("search request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Search document stored");
            metrics::counter!("storage.search.upserts").increment(1);
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = format!("search backend returned {status}: {body}");

        if is_retryable(status) {
            Err(StoreError::Unavailable(message))
        } else {
            Err(StoreError::Rejected(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ElasticsearchBackend {
        ElasticsearchBackend::new(&SearchConfig {
            url: "http://search:9200/".to_string(),
            index: "images-index".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_document_url() {
        assert_eq!(
            backend().document_url("550e8400-e29b-41d4-a716-446655440000"),
            "http://search:9200/images-index/_doc/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            backend().document_url("a/b c"),
            "http://search:9200/images-index/_doc/a%2Fb%20c"
        );
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
