// Follow-up worker: scans for due follow-ups and runs their steps

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use steward_followup::notify::{HttpNotificationGateway, LogOnlyGateway, NotificationGateway};
use steward_followup::{
    Dispatcher, FollowupConfig, PostgresDirectory, PostgresFollowupStore, StepExecutor,
    StepPlanner, SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG wins; otherwise LOG_LEVEL applies to both crates
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("steward_followup={log_level},steward_worker={log_level}").into()
        }))
        .with(fmt::layer())
        .init();

    tracing::info!("steward-worker starting...");

    let config = FollowupConfig::from_env().context("Invalid configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresFollowupStore::new(pool.clone()));
    store.migrate().await.context("Failed to run migrations")?;

    let gateway: Arc<dyn NotificationGateway> = match &config.notification_webhook_url {
        Some(url) => Arc::new(
            HttpNotificationGateway::new(url.clone())
                .context("Failed to create notification gateway")?,
        ),
        None => {
            tracing::warn!("NOTIFICATION_WEBHOOK_URL not set, steps will be logged as skipped");
            Arc::new(LogOnlyGateway)
        }
    };

    let clock = Arc::new(SystemClock);
    let executor = Arc::new(
        StepExecutor::new(
            store.clone(),
            Arc::new(PostgresDirectory::new(pool)),
            gateway,
            clock.clone(),
        )
        .with_planner(StepPlanner::new(config.default_staff_role.clone())),
    );

    tracing::info!(
        scan_interval_ms = config.dispatcher.scan_interval.as_millis() as u64,
        max_concurrency = config.dispatcher.max_concurrency,
        batch_size = config.dispatcher.scanner.batch_size,
        "Starting follow-up dispatcher"
    );

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        executor,
        clock,
        config.dispatcher.clone(),
    ));

    let runner = dispatcher.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });

    // Run the dispatcher (blocks until shutdown)
    tokio::select! {
        result = &mut handle => {
            result.context("Dispatcher task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            dispatcher.shutdown();
            if let Err(e) = handle.await.context("Dispatcher task panicked")? {
                tracing::error!(error = %e, "Dispatcher did not shut down cleanly");
                return Err(e.into());
            }
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
