use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use pixcast_pipeline::{BlobStore, StoreError};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Build an S3 client from service configuration
pub async fn connect(config: &S3Config) -> S3Client {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;

    let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

    // Custom endpoint for MinIO/LocalStack
    if let Some(ref endpoint_url) = config.endpoint_url {
        s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
    }

    if config.force_path_style {
        s3_config_builder = s3_config_builder.force_path_style(true);
    }

    info!(region = %config.region, "S3 client initialized");

    S3Client::from_conf(s3_config_builder.build())
}

/// One bucket exposed as a [`BlobStore`]
#[derive(Clone)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Time-limited URL that lets a client PUT `key` directly into the bucket
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn presign_upload(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Rejected(format!("invalid presign expiry: {e}")))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to presign upload: {e}")))?;

        Ok(presigned.uri().to_string())
    }
}

/// Map an SDK failure: service-side 4xx are permanent, everything else
/// (timeouts, dispatch failures, 5xx, throttling) can succeed on retry.
fn classify<E, R>(err: SdkError<E, R>, action: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    let message = format!("{action}: {}", aws_sdk_s3::error::DisplayErrorContext(&err));

    match (&err, code.as_deref()) {
        (_, Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable")) => {
            StoreError::Unavailable(message)
        }
        (SdkError::ServiceError(_), _) => StoreError::Rejected(message),
        _ => StoreError::Unavailable(message),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StoreError::NotFound(format!("s3://{}/{}", self.bucket, key)));
                }
                return Err(classify(e, "failed to get object"));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to read object body: {e}")))?;

        let bytes = body.into_bytes().to_vec();
        debug!(size_bytes = bytes.len(), "Object fetched from S3");
        metrics::counter!("storage.s3.reads").increment(1);

        Ok(bytes)
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify(e, "failed to put object"))?;

        debug!("Object written to S3");
        metrics::counter!("storage.s3.writes").increment(1);

        Ok(())
    }
}
