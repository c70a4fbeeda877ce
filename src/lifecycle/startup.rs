//! Startup orchestration.
//!
//! # Responsibilities
//! - Prepare cache storage once, before any worker exists
//! - Fork the worker processes, each with its own transfer channel
//! - Build the dispatcher's runtime pieces and run it until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Workers fork before any runtime or thread is created
//! - A worker dies with its parent (`PR_SET_PDEATHSIG` on Linux)

use std::net::SocketAddr;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;

use nix::unistd::{fork, ForkResult};
use thiserror::Error;

use crate::cache::{CacheStore, StoreError};
use crate::config::{ConfigError, ProxyConfig};
use crate::dispatcher::{Dispatcher, ForkedWorker, Stats, WorkerHandle};
use crate::lifecycle::Shutdown;
use crate::net::{channel_pair, Listener, ListenerError, TransferChannel, TransferError};
use crate::observability::logging::LoggingError;
use crate::observability::metrics;
use crate::worker::Worker;

/// Error type for everything that can abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("cache storage initialization failed: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to create worker channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("fork failed: {0}")]
    Fork(#[from] nix::Error),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Create cache storage if caching is on. Runs in the parent before forking.
pub fn prepare_storage(config: &ProxyConfig) -> Result<(), StartupError> {
    if config.storage.enable_cache {
        CacheStore::initialize(&config.storage)?;
        tracing::info!(storage = ?config.storage.storage, "Cache storage ready");
    }
    Ok(())
}

/// Fork `count` workers named `p0..pN`. Only the parent returns.
pub fn fork_workers(
    count: usize,
    listener: Listener,
    config: &ProxyConfig,
) -> Result<(Listener, Vec<ForkedWorker>), StartupError> {
    let mut forked: Vec<ForkedWorker> = Vec::with_capacity(count);

    for index in 0..count {
        let name = format!("p{index}");
        let (parent_end, child_end) = channel_pair().map_err(StartupError::Channel)?;

        // SAFETY: the process is single-threaded here; no runtime has been built yet.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(child_end);
                tracing::info!(worker = %name, pid = %child, "Worker started");
                forked.push(ForkedWorker {
                    name,
                    pid: child,
                    channel: parent_end,
                });
            }
            ForkResult::Child => {
                drop(parent_end);
                drop(forked);
                drop(listener);
                let code = run_worker_process(name, child_end, config);
                std::process::exit(code);
            }
        }
    }

    Ok((listener, forked))
}

/// Body of a forked worker. Returns the process exit code.
fn run_worker_process(name: String, channel: StdUnixDatagram, config: &ProxyConfig) -> i32 {
    die_with_parent();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(worker = %name, error = %e, "Failed to build worker runtime");
            return 1;
        }
    };

    runtime.block_on(async move {
        let channel = match TransferChannel::from_std(channel) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(worker = %name, error = %e, "Failed to register channel");
                return 1;
            }
        };
        let worker = Worker::from_config(name, config);
        match worker.run(channel).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "Worker stopped");
                1
            }
        }
    })
}

#[cfg(target_os = "linux")]
fn die_with_parent() {
    // SAFETY: prctl with PR_SET_PDEATHSIG only reads its integer arguments.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent() {}

/// Run the dispatcher in the parent until SIGINT or SIGTERM.
pub async fn run_dispatcher(
    listener: Listener,
    forked: Vec<ForkedWorker>,
    config: &ProxyConfig,
) -> Result<Stats, StartupError> {
    let listener = listener.into_tokio()?;

    if !config.dispatcher.metrics_address.is_empty() {
        match config.dispatcher.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.dispatcher.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let handles = forked
        .into_iter()
        .map(|w| -> Result<WorkerHandle, StartupError> {
            let channel = TransferChannel::from_std(w.channel)?;
            Ok(WorkerHandle::new(w.name, Some(w.pid), channel))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    shutdown
        .trigger_on_signals()
        .map_err(StartupError::Signals)?;

    let dispatcher = Dispatcher::new(listener, handles, config.dispatcher.clone());
    Ok(dispatcher.run(receiver).await)
}
