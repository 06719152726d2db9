//! services/scheduler/src/bin/scheduler.rs

use repetition_core::{SchedulerCore, SchedulerSettings, SystemClock};
use scheduler_lib::{
    adapters::{db::DbAdapter, mailer::SmtpNotifier},
    config::{Config, RunMode},
    driver,
    error::ServiceError,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting scheduler...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    let db_adapter = DbAdapter::new(db_pool.clone());
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize the Mail Adapter ---
    if config.smtp.is_none() {
        info!("SMTP_HOST is not set; repetition emails will be logged, not sent.");
    }
    let notifier = SmtpNotifier::new(
        db_adapter.clone(),
        config.smtp.as_ref(),
        &config.mail_from,
        config.web_url.clone(),
    )?;

    // --- 4. Build the Scheduler Core ---
    let core = Arc::new(SchedulerCore::new(
        Arc::new(db_adapter),
        Arc::new(notifier),
        SchedulerSettings {
            concurrency: config.concurrency,
            notify_timeout: config.notify_timeout,
        },
    ));
    let clock = Arc::new(SystemClock);

    // --- 5. Run ---
    match config.run_mode {
        RunMode::Once => {
            info!("Running a single tick.");
            driver::run_once(&core, clock.as_ref()).await;
        }
        RunMode::Loop => {
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Could not listen for the shutdown signal");
                    return;
                }
                info!("Received Ctrl-C.");
                signal_token.cancel();
            });

            driver::run_loop(core, clock, shutdown).await;
        }
    }

    db_pool.close().await;
    info!("Scheduler stopped.");
    Ok(())
}
