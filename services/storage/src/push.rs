use crate::config::PushConfig;
use async_trait::async_trait;
use pixcast_pipeline::{PushError, PushTransport};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Pushes payloads through the gateway's `POST /connections/{id}` API
pub struct HttpPushTransport {
    client: Client,
    base_url: String,
}

impl HttpPushTransport {
    pub fn new(config: &PushConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn connection_url(&self, connection_id: &str) -> String {
        format!(
            "{}/connections/{}",
            self.base_url,
            urlencoding::encode(connection_id)
        )
    }
}

/// Only 410 confirms the connection is gone. A 404 or 421 can come from a
/// misrouted request while the connection is still live elsewhere.
fn classify_status(status: StatusCode) -> Result<(), PushError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::GONE {
        Err(PushError::Gone)
    } else {
        Err(PushError::Other(format!("gateway returned {status}")))
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, connection_id: &str, payload: &[u8]) -> Result<(), PushError> {
        let response = self
            .client
            .post(self.connection_url(connection_id))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| PushError::Other(e.to_string()))?;

        let status = response.status();
        debug!(connection_id, status = status.as_u16(), "Push completed");

        classify_status(status)
    }
}
