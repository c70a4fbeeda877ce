//! Forward HTTP proxy (v1)
//!
//! Accepts HTTP/1.x proxy requests and hands each client connection to one of
//! a fixed number of pre-forked worker processes.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────── DISPATCHER PROCESS ───────────────────────────┐
//!                 │                                                                           │
//!   Client ───────┼─▶ listener ─▶ watch idle sockets ─▶ ready queue ─▶ first READY worker    │
//!                 │                    ▲                                      │ SCM_RIGHTS    │
//!                 │                    │ DONE_OPEN                            ▼               │
//!                 │               reap reports ◀───────────── report (JSON datagram)          │
//!                 └───────────────────────────────────────────────────────────────────────────┘
//!                                                           │
//!                 ┌──────────────── WORKER PROCESS pN (×N) ─▼─────────────────────────────────┐
//!                 │  read request ─▶ GET: cache (FS | DB) or origin ─▶ response                │
//!                 │               └▶ CONNECT: tunnel       └▶ 400/408/501/502/504/598         │
//!                 └───────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use forward_proxy::config::load_config;
use forward_proxy::lifecycle::startup::{self, StartupError};
use forward_proxy::net::Listener;
use forward_proxy::observability::logging;

#[derive(Parser)]
#[command(name = "forward-proxy", version, about = "Forward HTTP proxy with a pre-forked worker pool")]
struct Cli {
    /// Address to listen on.
    bind_address: String,

    /// Port to listen on.
    bind_port: u16,

    /// Number of worker processes.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    worker_count: u16,

    /// Path to the configuration file.
    #[arg(long, default_value = "proxy.toml")]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).map_err(StartupError::from)?;
    let log_file = logging::init(&config.general).map_err(StartupError::from)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        log_file = %log_file.display(),
        workers = cli.worker_count,
        storage = ?config.storage.storage,
        caching = config.storage.enable_cache,
        "forward-proxy starting"
    );

    let listener = Listener::bind(&cli.bind_address, cli.bind_port).map_err(StartupError::from)?;
    startup::prepare_storage(&config)?;
    let (listener, workers) =
        startup::fork_workers(usize::from(cli.worker_count), listener, &config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    runtime.block_on(startup::run_dispatcher(listener, workers, &config))?;

    tracing::info!("Shutdown complete");
    Ok(())
}
