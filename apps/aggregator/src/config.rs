//! Environment-driven configuration, validated fail-fast at startup.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;

use baler_bundle::BundleConfig;

const MIB: u64 = 1024 * 1024;

/// TTL floor keeping claims alive well past the store's expiry-sweep
/// latency, so a record cannot be reprocessed inside the sweep window.
const MIN_IDEMPOTENCY_TTL_DAYS: u64 = 3;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    /// Tracing filter directive for this level. Critical has no tracing
    /// counterpart and maps to error.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub distribution_bucket: String,
    pub idempotency_table: String,
    pub service_name: String,
    pub environment: String,
    pub idempotency_ttl_days: u64,
    pub max_bundle_input_mb: u64,
    pub max_bundle_on_disk_mb: u64,
    pub spool_file_max_size_mb: u64,
    pub timeout_guard_threshold_seconds: u64,
    pub max_fetch_workers: usize,
    pub queue_put_timeout_seconds: u64,
    pub bundle_encryption_key_id: Option<String>,
    pub log_level: LogLevel,
}

impl AppConfig {
    /// Reads and validates every recognized key. Missing required values
    /// and out-of-range numbers fail here, before any work starts.
    pub fn load_from_env() -> Result<Self, ConfigurationError> {
        let distribution_bucket = required("DISTRIBUTION_BUCKET_NAME")?;
        let idempotency_table = required("IDEMPOTENCY_TABLE_NAME")?;
        let service_name = required("SERVICE_NAME")?;
        let environment = required("ENVIRONMENT")?;

        let idempotency_ttl_days = parsed_or("IDEMPOTENCY_TTL_DAYS", 7u64)?;
        if idempotency_ttl_days < MIN_IDEMPOTENCY_TTL_DAYS {
            return Err(ConfigurationError::InvalidVar {
                var: "IDEMPOTENCY_TTL_DAYS",
                reason: format!("must be at least {MIN_IDEMPOTENCY_TTL_DAYS} days"),
            });
        }

        let max_bundle_input_mb = positive("MAX_BUNDLE_INPUT_MB", 100u64)?;
        let max_bundle_on_disk_mb = positive("MAX_BUNDLE_ON_DISK_MB", 400u64)?;
        let spool_file_max_size_mb = positive("SPOOL_FILE_MAX_SIZE_MB", 64u64)?;
        let timeout_guard_threshold_seconds =
            positive("TIMEOUT_GUARD_THRESHOLD_SECONDS", 10u64)?;
        let queue_put_timeout_seconds = positive("QUEUE_PUT_TIMEOUT_SECONDS", 5u64)?;

        let max_fetch_workers = parsed_or("MAX_FETCH_WORKERS", 8usize)?;
        if max_fetch_workers == 0 {
            return Err(ConfigurationError::InvalidVar {
                var: "MAX_FETCH_WORKERS",
                reason: "must be a positive integer".into(),
            });
        }

        let bundle_encryption_key_id = std::env::var("BUNDLE_ENCRYPTION_KEY_ID")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let raw_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".into());
        let log_level =
            LogLevel::parse(&raw_level).ok_or_else(|| ConfigurationError::InvalidVar {
                var: "LOG_LEVEL",
                reason: format!(
                    "must be one of DEBUG, INFO, WARNING, ERROR, CRITICAL, not {raw_level:?}"
                ),
            })?;

        Ok(Self {
            distribution_bucket,
            idempotency_table,
            service_name,
            environment,
            idempotency_ttl_days,
            max_bundle_input_mb,
            max_bundle_on_disk_mb,
            spool_file_max_size_mb,
            timeout_guard_threshold_seconds,
            max_fetch_workers,
            queue_put_timeout_seconds,
            bundle_encryption_key_id,
            log_level,
        })
    }

    /// Process-wide configuration, read from the environment exactly once.
    pub fn global() -> Result<&'static AppConfig, ConfigurationError> {
        static CONFIG: OnceLock<AppConfig> = OnceLock::new();
        if let Some(config) = CONFIG.get() {
            return Ok(config);
        }
        let loaded = Self::load_from_env()?;
        Ok(CONFIG.get_or_init(|| loaded))
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_days * 86_400)
    }

    pub fn max_bundle_input_bytes(&self) -> u64 {
        self.max_bundle_input_mb * MIB
    }

    pub fn bundle_config(&self) -> BundleConfig {
        BundleConfig {
            spool_threshold_bytes: self.spool_file_max_size_mb * MIB,
            max_on_disk_bytes: self.max_bundle_on_disk_mb * MIB,
            timeout_guard: Duration::from_secs(self.timeout_guard_threshold_seconds),
            fetch_workers: self.max_fetch_workers,
            queue_put_timeout: Duration::from_secs(self.queue_put_timeout_seconds),
        }
    }
}

fn required(var: &'static str) -> Result<String, ConfigurationError> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigurationError::MissingVar(var))
}

fn parsed_or<T>(var: &'static str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigurationError::InvalidVar {
                var,
                reason: err.to_string(),
            }),
    }
}

fn positive(var: &'static str, default: u64) -> Result<u64, ConfigurationError> {
    let value = parsed_or(var, default)?;
    if value == 0 {
        return Err(ConfigurationError::InvalidVar {
            var,
            reason: "must be a positive integer".into(),
        });
    }
    Ok(value)
}
