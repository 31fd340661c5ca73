//! Pixcast real-time gateway
//!
//! Holds the persistent client sockets that image notifications are pushed
//! to. Every accepted socket gets a fresh connection id that is recorded in
//! the shared connection registry, and removed again when the socket closes.
//!
//! # Architecture
//!
//! ```text
//! client ──/ws──▶ ConnectionHub ──▶ ConnectionRegistry (Postgres)
//!                      ▲
//! broadcaster ──POST /connections/{id}──┘   (410 when the id has no socket)
//! ```
//!
//! Connection ids carry the `server.instance_id` of the gateway that minted
//! them. A gateway answers 421 for another instance's id, so a misrouted push
//! never prunes a live connection. The storage service pushes to a single
//! `push.url`, which therefore has to reach the owning instance: run one
//! gateway, or route `/connections/{instance_id}:*` to that instance.

mod config;
mod hub;
mod server;

use anyhow::Context;
use config::GatewayConfig;
use hub::ConnectionHub;
use pixcast_pipeline::{ConnectionRegistry, Dispatcher, EventProducer};
use pixcast_storage::MetadataStore;
use server::{create_router, GatewayState};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load().context("Failed to load configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = "pixcast-gateway",
        version = env!("CARGO_PKG_VERSION"),
        "Starting real-time gateway"
    );

    config.validate()?;

    if config.metrics.enabled {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .context("Failed to install Prometheus metrics exporter")?;
        info!(port = config.metrics.port, "Prometheus metrics exporter started");
    }

    let store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to connect connection registry store")?,
    );
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let producer = Arc::new(
        EventProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    let state = GatewayState {
        hub: Arc::new(ConnectionHub::new(config.server.instance_id.clone())),
        registry: Arc::new(ConnectionRegistry::new(store)),
        dispatcher: Arc::new(Dispatcher::new(config.retry.clone(), producer.clone())),
        ping_interval: config.server.ping_interval(),
    };

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!(address = %addr, instance_id = %config.server.instance_id, "Gateway listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server error")?;

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        error!(error = %e, "Failed to flush producer");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pixcast_gateway={}", level).parse()?)
        .add_directive(format!("pixcast_pipeline={}", level).parse()?)
        .add_directive("rdkafka=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

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
        _ = ctrl_c => info!("Received Ctrl+C, draining connections"),
        _ = terminate => info!("Received SIGTERM, draining connections"),
    }
}
