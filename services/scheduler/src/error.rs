//! services/scheduler/src/error.rs
//!
//! Defines the primary error type for the scheduler service.

use crate::config::ConfigError;

/// The primary error type for the `scheduler` service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents an error while applying database migrations.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a failure to build the SMTP transport.
    #[error("Mail transport error: {0}")]
    Mail(#[from] lettre::transport::smtp::Error),
}
