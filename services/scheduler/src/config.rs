//! services/scheduler/src/config.rs
//!
//! Defines the service's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// How the binary drives ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Tick at every minute boundary until shut down.
    Loop,
    /// Run a single tick at the current instant and exit.
    Once,
}

/// SMTP relay settings. Absent when mail should only be logged.
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub log_level: Level,
    pub run_mode: RunMode,
    pub concurrency: usize,
    pub notify_timeout: Duration,
    pub smtp: Option<SmtpConfig>,
    pub mail_from: String,
    pub web_url: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Database Settings ---
        let database_url =
            var("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
        let db_max_connections = parse_or("DB_MAX_CONNECTIONS", var("DB_MAX_CONNECTIONS"), 5u32)?;

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Scheduler Settings ---
        let run_mode = match var("SCHEDULER_MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("loop") => RunMode::Loop,
            Some("once") => RunMode::Once,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "SCHEDULER_MODE".to_string(),
                    format!("'{}' is not one of 'loop' or 'once'", other),
                ))
            }
        };

        let concurrency = parse_or("SCHEDULER_CONCURRENCY", var("SCHEDULER_CONCURRENCY"), 4usize)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "SCHEDULER_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let notify_timeout = Duration::from_secs(parse_or(
            "NOTIFY_TIMEOUT_SECS",
            var("NOTIFY_TIMEOUT_SECS"),
            30u64,
        )?);

        // --- Mail Settings ---
        let smtp = match var("SMTP_HOST").filter(|h| !h.trim().is_empty()) {
            Some(host) => Some(SmtpConfig {
                host,
                port: parse_or("SMTP_PORT", var("SMTP_PORT"), 587u16)?,
                username: var("SMTP_USERNAME"),
                password: var("SMTP_PASSWORD"),
            }),
            None => None,
        };
        let mail_from = var("MAIL_FROM").unwrap_or_else(|| "noreply@localhost".to_string());
        let web_url = var("WEB_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            database_url,
            db_max_connections,
            log_level,
            run_mode,
            concurrency,
            notify_timeout,
            smtp,
            mail_from,
            web_url,
        })
    }
}

fn parse_or<T>(name: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}
