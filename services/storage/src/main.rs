use anyhow::{Context, Result};
use pixcast_pipeline::{ConnectionRegistry, Dispatcher, EventProducer, IngestionWriter};
use pixcast_storage::{
    s3_store, start_api_server, AppState, Config, ElasticsearchBackend, HttpPushTransport,
    MetadataStore, PipelineWorkers, S3BlobStore, WorkerDeps,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting Pixcast storage service");

    init_metrics(config.service.metrics_port)?;

    let metadata_store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let s3_client = s3_store::connect(&config.s3).await;
    let images = Arc::new(S3BlobStore::new(s3_client.clone(), &config.s3.images_bucket));
    let thumbnails = Arc::new(S3BlobStore::new(s3_client, &config.s3.thumbnails_bucket));

    let producer = Arc::new(
        EventProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );
    let dispatcher = Arc::new(Dispatcher::new(config.retry.clone(), producer.clone()));

    let writer = Arc::new(IngestionWriter::new(
        metadata_store.clone(),
        metadata_store.clone(),
        producer.clone(),
    ));

    let workers = PipelineWorkers::spawn(
        &config.kafka,
        &config.workers,
        dispatcher,
        WorkerDeps {
            images: images.clone(),
            thumbnails,
            thumbnail_key_prefix: config.s3.thumbnail_key_prefix.clone(),
            search: Arc::new(
                ElasticsearchBackend::new(&config.search)
                    .context("Failed to create search client")?,
            ),
            registry: Arc::new(ConnectionRegistry::new(metadata_store.clone())),
            push: Arc::new(
                HttpPushTransport::new(&config.push).context("Failed to create push client")?,
            ),
        },
    )
    .context("Failed to start pipeline workers")?;

    let relay = writer.relay();
    let relay_interval = config.relay_interval();
    let relay_handle = tokio::spawn({
        let relay = relay.clone();
        async move { relay.run(relay_interval).await }
    });

    let api_state = AppState {
        writer,
        signer: images,
        upload_url_expiry: config.upload_url_expiry(),
    };

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        subscribers = ?workers.subscribers(),
        "Storage service started successfully"
    );

    let worker_failed = tokio::select! {
        _ = shutdown_signal() => false,
        _ = workers.failed() => {
            error!("A pipeline worker stopped unexpectedly");
            true
        }
    };

    info!("Shutting down storage service");

    api_handle.abort();
    workers.shutdown(WORKER_SHUTDOWN_GRACE).await;

    relay.shutdown();
    if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, relay_handle).await.is_err() {
        error!("Outbox relay did not stop in time");
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        error!(error = %e, "Failed to flush producer");
    }

    info!("Storage service stopped");

    if worker_failed {
        anyhow::bail!("Pipeline worker failed");
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
