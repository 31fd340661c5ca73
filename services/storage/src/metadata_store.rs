use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pixcast_pipeline::{
    ChangeEvent, ConnectionStore, GroupStore, ImageRecord, ImageStore, PendingChange, StoreError,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info, instrument};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Groups, image records, the change outbox and live connections in PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Postgres failures as store errors: constraint violations are permanent,
/// connectivity problems are transient.
pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => StoreError::Conflict(db.message().to_string()),
            Some(FOREIGN_KEY_VIOLATION) => StoreError::NotFound(db.message().to_string()),
            _ => StoreError::Rejected(db.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => StoreError::Unavailable(err.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl GroupStore for MetadataStore {
    async fn group_exists(&self, group_id: &str) -> Result<bool, StoreError> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM groups WHERE id = $1)")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(exists.0)
    }
}

#[async_trait]
impl ImageStore for MetadataStore {
    #[instrument(skip(self, record, change), fields(group_id = %record.group_id, image_id = %record.image_id))]
    async fn put_image(
        &self,
        record: &ImageRecord,
        change: &PendingChange,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO images (group_id, timestamp, image_id, record, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(&record.group_id)
        .bind(&record.timestamp)
        .bind(&record.image_id)
        .bind(Json(record))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("INSERT INTO change_outbox (change_id, event) VALUES ($1, $2)")
            .bind(&change.change_id)
            .bind(Json(&change.event))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(change_id = %change.change_id, "Image record and change inserted");
        metrics::counter!("storage.images.inserted").increment(1);

        Ok(())
    }

    async fn pending_changes(&self, limit: usize) -> Result<Vec<PendingChange>, StoreError> {
        let rows: Vec<(String, Json<ChangeEvent>)> = sqlx::query_as(
            r#"
            SELECT change_id, event FROM change_outbox
            WHERE published_at IS NULL
            ORDER BY seq
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(change_id, Json(event))| PendingChange { change_id, event })
            .collect())
    }

    async fn mark_published(&self, change_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE change_outbox SET published_at = NOW() WHERE change_id = $1")
            .bind(change_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for MetadataStore {
    async fn put_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO connections (connection_id, connected_at)
            VALUES ($1, NOW())
            ON CONFLICT (connection_id) DO UPDATE SET connected_at = EXCLUDED.connected_at
            "#,
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM connections WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn scan_connections(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT connection_id FROM connections")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
