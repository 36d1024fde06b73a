//! Courier webhook delivery service.
//!
//! Main entry point. Loads configuration, connects the PostgreSQL queue that
//! producers enqueue into, runs the delivery engine and coordinates graceful
//! shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier::{Config, LoggingAlertHandler};
use courier_core::{Clock, RealClock};
use courier_delivery::{postgres, DeliveryEngine, PostgresDeadLetterStore, PostgresJobQueue};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!("Starting Courier webhook delivery service");
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("<unset>"),
        worker_pool_size = config.worker_pool_size,
        batch_size = config.worker_batch_size,
        max_retry_attempts = config.max_retry_attempts,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let alerts = Arc::new(LoggingAlertHandler::new());

    let database_url = config.require_database_url()?;
    let db_pool = create_database_pool(&config, database_url).await?;
    info!("Database connection pool established");

    postgres::migrate(&db_pool).await.context("Failed to run delivery migrations")?;
    info!("Database migrations completed");

    let mut engine = DeliveryEngine::builder(config.to_delivery_config())
        .with_clock(clock.clone())
        .with_event_handler(alerts.clone())
        .with_queue(Arc::new(PostgresJobQueue::new(db_pool.clone(), clock.clone())))
        .with_dead_letter_store(Arc::new(PostgresDeadLetterStore::new(db_pool.clone())))
        .build()
        .context("Failed to build delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;
    info!(workers = config.worker_pool_size, "Courier is ready to deliver webhooks");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown");
        },
        () = report_metrics(&engine, config.metrics_report_interval_seconds) => {},
    }

    let alerts_raised = alerts.alerts_raised();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!(alerts_raised, "Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter directives.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("Invalid log filter directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config, database_url: &str) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Logs an aggregate metrics summary on a fixed interval. Never returns
/// when reporting is enabled.
async fn report_metrics(engine: &DeliveryEngine, interval_seconds: u64) {
    if interval_seconds == 0 {
        std::future::pending::<()>().await;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
    interval.tick().await;

    loop {
        interval.tick().await;

        let totals = engine.aggregate_metrics();
        let stats = engine.stats().await;
        let pending = match engine.pending_jobs().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to count pending jobs");
                0
            },
        };

        info!(
            total_deliveries = totals.total_deliveries,
            successful_deliveries = totals.successful_deliveries,
            failed_deliveries = totals.failed_deliveries,
            success_rate = totals.success_rate(),
            average_latency_ms = totals.average_latency_ms,
            retries_scheduled = totals.retries_scheduled,
            dead_lettered = totals.dead_lettered,
            duplicates_suppressed = totals.duplicates_suppressed,
            in_flight = stats.in_flight_deliveries,
            pending,
            "Delivery metrics"
        );
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
