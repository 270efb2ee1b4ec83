//! Postbox transactional event relay daemon.
//!
//! Runs the sender scheduler over the outbox table and, when enabled, the
//! inbound receiver. Applications that consume events embed the dispatch
//! crate directly with their own handler registry.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use config::Config;
use postbox_broker::{NatsBroker, NatsSubscriber};
use postbox_core::{storage::Storage, RealClock};
use postbox_dispatch::{PostgresInboxStore, PostgresOutboxStore, Receiver, Sender};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting postbox event relay");
    info!(
        database_url = %config.database_url_masked(),
        nats_url = %config.nats_url,
        publish_subject = %config.publish_subject,
        receiver_enabled = config.receiver_enabled,
        worker_id = %config.sender_worker_id,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let clock = Arc::new(RealClock);
    let storage = Arc::new(Storage::new(db_pool.clone(), clock.clone()));
    storage.health_check().await.context("Database health check failed")?;

    let broker = NatsBroker::connect(&config.nats_url, config.publish_subject.clone())
        .await
        .context("Failed to connect to NATS")?;

    let sender = Arc::new(Sender::new(
        Arc::new(PostgresOutboxStore::new(storage.clone())),
        Arc::new(broker),
        config.to_sender_config(),
        clock.clone(),
    ));
    let sender_handle = tokio::spawn({
        let sender = sender.clone();
        async move { sender.run().await }
    });

    let receiver_parts = if config.receiver_enabled {
        let subscriber = NatsSubscriber::connect(
            &config.nats_url,
            config.inbound_stream.clone(),
            config.inbound_subject.clone(),
            config.inbound_durable.clone(),
        )
        .await
        .context("Failed to set up inbound subscription")?;

        let receiver = Arc::new(Receiver::new(
            Arc::new(PostgresInboxStore::new(storage.clone())),
            Arc::new(subscriber),
        ));
        let cancel = receiver.cancellation_token();
        let handle = tokio::spawn({
            let receiver = receiver.clone();
            async move {
                if let Err(e) = receiver.run().await {
                    error!(error = %e, "Receiver failed");
                }
            }
        });
        info!(
            stream = %config.inbound_stream,
            subject = %config.inbound_subject,
            "Inbound receiver started"
        );
        Some((cancel, handle))
    } else {
        None
    };

    info!("Postbox is relaying events");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = sender.shutdown(sender_handle).await {
        error!(error = %e, "Sender did not stop cleanly");
    }

    if let Some((cancel, handle)) = receiver_parts {
        cancel.cancel();
        let grace = Duration::from_millis(config.sender_shutdown_timeout_ms);
        if tokio::time::timeout(grace, handle).await.is_err() {
            error!(
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period expired, abandoning in-flight deliveries"
            );
        }
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Postbox shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter directives.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("Invalid log filter directives");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
