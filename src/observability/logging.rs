//! Structured logging.
//!
//! # Responsibilities
//! - Install the global subscriber once, before workers fork
//! - Write to the console and append to `<log_path>/proxy.log`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` overrides `general.log_level`
//! - Every process appends to the same file; lines carry the worker span

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::GeneralConfig;

pub const LOG_FILE: &str = "proxy.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("subscriber already installed: {0}")]
    Init(#[from] TryInitError),
}

/// Default filter directive for a configured level.
pub fn default_directive(level: &str) -> String {
    format!("forward_proxy={level}")
}

/// Install console and file logging.
pub fn init(general: &GeneralConfig) -> Result<PathBuf, LoggingError> {
    let path = general.log_path.join(LOG_FILE);
    let io_error = |source| LoggingError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(&general.log_path).map_err(io_error)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_error)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive(&general.log_level).into()),
        )
        .with(fmt::layer())
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()?;

    Ok(path)
}
