use crate::config::ApiConfig;
use crate::s3_store::S3BlobStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pixcast_pipeline::{ImageRecord, IngestError, IngestionWriter, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Issues the URL a client uses to upload the image bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadUrlSigner: Send + Sync {
    async fn upload_url(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}

#[async_trait]
impl UploadUrlSigner for S3BlobStore {
    async fn upload_url(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        self.presign_upload(key, expires_in).await
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub writer: Arc<IngestionWriter>,
    pub signer: Arc<dyn UploadUrlSigner>,
    pub upload_url_expiry: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageResponse {
    pub new_item: ImageRecord,
    /// Absent when signing failed; the record exists regardless
    pub upload_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error response with its status code
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, code: &str) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: code.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::GroupNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "Group does not exist", "GROUP_NOT_FOUND")
            }
            IngestError::InvalidPayload(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, message, "INVALID_PAYLOAD")
            }
            IngestError::Store(StoreError::Conflict(message)) => {
                ApiError::new(StatusCode::CONFLICT, message, "CONFLICT")
            }
            IngestError::Store(e) if e.is_transient() => {
                error!(error = %e, "Store unavailable");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage temporarily unavailable",
                    "UNAVAILABLE",
                )
            }
            IngestError::Store(e) => {
                error!(error = %e, "Failed to create image");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create image",
                    "STORE_ERROR",
                )
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/groups/:group_id/images", post(create_image))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storage-service"
    }))
}

/// Create an image record in a group and return a signed upload URL
#[instrument(skip(state, body))]
async fn create_image(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<CreateImageResponse>), ApiError> {
    let Value::Object(payload) = body else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON object",
            "INVALID_PAYLOAD",
        ));
    };

    let record = state.writer.create_image(&group_id, payload).await?;

    let upload_url = match state
        .signer
        .upload_url(&record.image_id, state.upload_url_expiry)
        .await
    {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(image_id = %record.image_id, error = %e, "Failed to sign upload URL");
            None
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateImageResponse {
            new_item: record,
            upload_url,
        }),
    ))
}

/// Start the ingestion API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pixcast_pipeline::memory::{MemoryGroupStore, MemoryImageStore};
    use pixcast_pipeline::{ChangeEvent, ChangeFeedPublisher};
    use tower::ServiceExt;

    struct NullFeed;

    #[async_trait]
    impl ChangeFeedPublisher for NullFeed {
        async fn publish_change(&self, _event: &ChangeEvent) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn signing_to(base: &'static str) -> MockUploadUrlSigner {
        let mut signer = MockUploadUrlSigner::new();
        signer
            .expect_upload_url()
            .times(1)
            .returning(move |key, _| Ok(format!("{base}/{key}?signed")));
        signer
    }

    fn router(signer: MockUploadUrlSigner) -> (Router, Arc<MemoryImageStore>) {
        let images = Arc::new(MemoryImageStore::new());
        let writer = IngestionWriter::new(
            Arc::new(MemoryGroupStore::with_groups(["g1"])),
            images.clone(),
            Arc::new(NullFeed),
        );
        let state = AppState {
            writer: Arc::new(writer),
            signer: Arc::new(signer),
            upload_url_expiry: Duration::from_secs(300),
        };
        (create_router(state, &ApiConfig::default()), images)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_image() {
        let (app, images) = router(signing_to("https://s3.test/images"));

        let response = app
            .oneshot(post("/groups/g1/images", r#"{"displayName":"Sunset"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        let image_id = body["newItem"]["imageId"].as_str().unwrap().to_string();

        assert_eq!(body["newItem"]["groupId"], "g1");
        assert_eq!(body["newItem"]["displayName"], "Sunset");
        assert_eq!(
            body["uploadUrl"],
            format!("https://s3.test/images/{image_id}?signed")
        );
        assert!(images.find(&image_id).is_some());
    }

    #[tokio::test]
    async fn test_unknown_group_is_404() {
        let mut signer = MockUploadUrlSigner::new();
        signer.expect_upload_url().never();
        let (app, images) = router(signer);

        let response = app
            .oneshot(post("/groups/missing/images", r#"{"displayName":"x"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "Group does not exist");
        assert!(images.records().is_empty());
    }

    #[tokio::test]
    async fn test_non_object_body_is_400() {
        let mut signer = MockUploadUrlSigner::new();
        signer.expect_upload_url().never();
        let (app, _) = router(signer);

        let response = app
            .oneshot(post("/groups/g1/images", r#"["not", "an", "object"]"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signing_failure_still_creates_record() {
        let mut signer = MockUploadUrlSigner::new();
        signer
            .expect_upload_url()
            .returning(|_, _| Err(StoreError::Unavailable("no credentials".to_string())));
        let (app, images) = router(signer);

        let response = app
            .oneshot(post("/groups/g1/images", "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(json_body(response).await["uploadUrl"].is_null());
        assert_eq!(images.records().len(), 1);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = router(MockUploadUrlSigner::new());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }
}
