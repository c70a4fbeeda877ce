//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the selected storage backend has a location
//! - Validate value ranges (timeouts > 0, known log level)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{ProxyConfig, StorageKind};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("storage.{0} must not be empty for the selected backend")]
    MissingStorageLocation(&'static str),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("dispatcher.probe_interval_secs must be greater than zero")]
    ZeroProbeInterval,

    #[error("unknown log level '{0}'")]
    UnknownLogLevel(String),

    #[error("dispatcher.metrics_address '{0}' is not a socket address")]
    BadMetricsAddress(String),
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match config.storage.storage {
        StorageKind::Fs if config.storage.cache_path.as_os_str().is_empty() => {
            errors.push(ValidationError::MissingStorageLocation("cache_path"));
        }
        StorageKind::Db if config.storage.db_path.as_os_str().is_empty() => {
            errors.push(ValidationError::MissingStorageLocation("db_path"));
        }
        _ => {}
    }

    let timeouts = &config.timeouts;
    for (name, secs) in [
        ("client_read_secs", timeouts.client_read_secs),
        ("origin_connect_secs", timeouts.origin_connect_secs),
        ("origin_read_secs", timeouts.origin_read_secs),
        ("tunnel_read_secs", timeouts.tunnel_read_secs),
        ("write_secs", timeouts.write_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.dispatcher.probe_interval_secs == 0 {
        errors.push(ValidationError::ZeroProbeInterval);
    }

    let level = config.general.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::UnknownLogLevel(config.general.log_level.clone()));
    }

    let metrics_address = &config.dispatcher.metrics_address;
    if !metrics_address.is_empty() && metrics_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::BadMetricsAddress(metrics_address.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
