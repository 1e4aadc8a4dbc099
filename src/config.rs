//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL; in-memory backends when absent
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    pub log_format: LogFormat,

    /// Attempts for a command whose append hits a conflict or outage
    pub append_max_attempts: u32,
    pub append_backoff: Duration,

    /// Default per-attempt step timeout
    pub step_timeout: Duration,
    pub step_max_attempts: u32,
    pub step_backoff: Duration,

    /// Concurrent workflow executions
    pub workflow_workers: usize,

    pub event_bus_capacity: usize,

    pub recovery_interval: Duration,
    pub projection_catch_up_interval: Duration,
    pub chain_audit_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &'static str, default: &str| -> String {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        fn number<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key))
        }

        fn positive<T: FromStr + PartialOrd + Default>(
            key: &'static str,
            raw: String,
        ) -> Result<T, ConfigError> {
            let value: T = number(key, raw)?;
            if value <= T::default() {
                return Err(ConfigError::InvalidValue(key));
            }
            Ok(value)
        }

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let database_max_connections =
            positive("DATABASE_MAX_CONNECTIONS", parse("DATABASE_MAX_CONNECTIONS", "10"))?;

        let host = parse("HOST", "127.0.0.1");
        let port = number("PORT", parse("PORT", "3000"))?;
        let environment = parse("ENVIRONMENT", "development");

        // Production never runs on the in-memory backends
        if environment == "production" && database_url.is_none() {
            return Err(ConfigError::MissingEnv("DATABASE_URL"));
        }

        let log_format = parse("LOG_FORMAT", "text")
            .parse()
            .map_err(|_| ConfigError::InvalidValue("LOG_FORMAT"))?;

        let append_max_attempts =
            positive("APPEND_MAX_ATTEMPTS", parse("APPEND_MAX_ATTEMPTS", "5"))?;
        let append_backoff_ms: u64 = number("APPEND_BACKOFF_MS", parse("APPEND_BACKOFF_MS", "25"))?;

        let step_timeout_ms: u64 = positive("STEP_TIMEOUT_MS", parse("STEP_TIMEOUT_MS", "30000"))?;
        let step_max_attempts = positive("STEP_MAX_ATTEMPTS", parse("STEP_MAX_ATTEMPTS", "3"))?;
        let step_backoff_ms: u64 = number("STEP_BACKOFF_MS", parse("STEP_BACKOFF_MS", "100"))?;

        let workflow_workers = positive("WORKFLOW_WORKERS", parse("WORKFLOW_WORKERS", "8"))?;
        let event_bus_capacity =
            positive("EVENT_BUS_CAPACITY", parse("EVENT_BUS_CAPACITY", "1024"))?;

        let recovery_secs: u64 =
            positive("RECOVERY_INTERVAL_SECS", parse("RECOVERY_INTERVAL_SECS", "30"))?;
        let catch_up_secs: u64 =
            positive("PROJECTION_CATCH_UP_SECS", parse("PROJECTION_CATCH_UP_SECS", "60"))?;
        let audit_secs: u64 =
            positive("CHAIN_AUDIT_INTERVAL_SECS", parse("CHAIN_AUDIT_INTERVAL_SECS", "3600"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            log_format,
            append_max_attempts,
            append_backoff: Duration::from_millis(append_backoff_ms),
            step_timeout: Duration::from_millis(step_timeout_ms),
            step_max_attempts,
            step_backoff: Duration::from_millis(step_backoff_ms),
            workflow_workers,
            event_bus_capacity,
            recovery_interval: Duration::from_secs(recovery_secs),
            projection_catch_up_interval: Duration::from_secs(catch_up_secs),
            chain_audit_interval: Duration::from_secs(audit_secs),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Retry policy for command appends
    pub fn append_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.append_max_attempts, self.append_backoff)
    }

    /// Retry policy for workflow steps
    pub fn step_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.step_max_attempts, self.step_backoff)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
