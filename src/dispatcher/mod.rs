//! Dispatcher: accepts clients and hands them to idle workers.
//!
//! # Data Flow
//! ```text
//! accept ──→ watch (readable? still ESTABLISHED?)
//!              │ readable
//!              ▼
//!           ready queue ──→ first READY worker (SCM_RIGHTS)
//!                                 │ report
//!                                 ▼
//!                  DONE_OPEN → watch again | DONE_CLOSE → half-close, close
//! ```
//!
//! # Design Decisions
//! - Single task owns all bookkeeping; watchers and report readers only send events
//! - Wakes at least once a second even when idle
//! - The ready queue is unbounded unless `max_pending` is set

pub mod pool;
pub mod stats;

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::DispatcherConfig;
use crate::http::Reply;
use crate::net::{half_close, is_established, send_all, ClientConnection};
use crate::observability::metrics;
use crate::worker::WorkerReport;

pub use pool::{ForkedWorker, Reaped, WorkerHandle, WorkerPool, WorkerStatus};
pub use stats::{Stats, Summary};

/// Bookkeeping period when nothing happens.
const TICK: Duration = Duration::from_secs(1);

/// Bound on writing a 503 to a rejected client.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of watching an idle client socket.
#[derive(Debug)]
enum WatchEvent {
    /// Bytes are waiting to be read.
    Ready(ClientConnection),
    /// The peer went away.
    Closed(ClientConnection),
}

pub struct Dispatcher {
    listener: TcpListener,
    pool: WorkerPool<ClientConnection>,
    handles: Vec<WorkerHandle>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        handles: Vec<WorkerHandle>,
        config: DispatcherConfig,
    ) -> Self {
        let pool = WorkerPool::new(handles.iter().map(|h| h.name().to_string()));
        Self {
            listener,
            pool,
            handles,
            config,
        }
    }

    /// Run until `shutdown` fires, then stop the workers and return the statistics.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Stats {
        let (report_tx, mut reports) = mpsc::unbounded_channel::<(usize, WorkerReport)>();
        let mut readers = JoinSet::new();
        for (worker, handle) in self.handles.iter().enumerate() {
            let channel = Arc::clone(handle.channel());
            let name = handle.name().to_string();
            let tx = report_tx.clone();
            readers.spawn(async move {
                loop {
                    match channel.receive_report::<WorkerReport>().await {
                        Ok(report) => {
                            if tx.send((worker, report)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(worker = %name, error = %e, "Report channel failed");
                            break;
                        }
                    }
                }
            });
        }
        drop(report_tx);

        let probe_interval = self.config.probe_interval();
        let mut watchers: JoinSet<WatchEvent> = JoinSet::new();
        let mut ready: VecDeque<ClientConnection> = VecDeque::new();
        let mut stats = Stats::new();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(workers = self.pool.len(), "Dispatcher running");

        loop {
            let mut became_ready = false;
            let mut ticked = false;

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let client = ClientConnection::new(stream, peer);
                        tracing::debug!(
                            connection = %client.id(),
                            peer = %client.peer(),
                            "Accepted"
                        );
                        metrics::record_connection_accepted();
                        watchers.spawn(watch(client, probe_interval));
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                Some(joined) = watchers.join_next(), if !watchers.is_empty() => match joined {
                    Ok(WatchEvent::Ready(client)) => {
                        became_ready = true;
                        self.enqueue(&mut ready, client).await;
                    }
                    Ok(WatchEvent::Closed(client)) => {
                        tracing::debug!(connection = %client.id(), "Client gone while idle");
                    }
                    Err(e) => tracing::warn!(error = %e, "Watcher task failed"),
                },
                Some((worker, report)) = reports.recv() => {
                    self.pool.record_report(worker, report);
                }
                _ = tick.tick() => ticked = true,
            }

            if ticked {
                self.retire_exited_workers();
                prune_ready(&mut ready);
            }

            for reaped in self.pool.reap() {
                stats.fold(&reaped.counters);
                metrics::record_connection_done(&reaped.counters);
                let Some(client) = reaped.client else {
                    continue;
                };
                let worker = self.pool.name(reaped.worker);
                if reaped.status == WorkerStatus::DoneOpen {
                    tracing::debug!(connection = %client.id(), worker, "Back to watching");
                    watchers.spawn(watch(client, probe_interval));
                } else {
                    half_close(&client);
                    tracing::debug!(connection = %client.id(), worker, "Closed");
                }
            }

            self.assign(&mut ready).await;

            let active = self.pool.active_count();
            if became_ready {
                stats.sample(active);
            }
            metrics::record_active_workers(active);
            tracing::trace!(
                completed = stats.totals().complete,
                active_workers = active,
                open_sockets = watchers.len() + ready.len() + active,
                watching = watchers.len(),
                ready = ready.len(),
                "Dispatcher iteration"
            );
        }

        readers.abort_all();
        watchers.abort_all();

        match stats.summary() {
            Some(summary) => tracing::info!(%summary, "Request statistics"),
            None => tracing::info!("No client became ready; no statistics"),
        }
        for (worker, handle) in self.handles.iter().enumerate() {
            if self.pool.status(worker) != WorkerStatus::Dead {
                handle.terminate();
            }
        }
        stats
    }

    /// Mark workers whose process has exited as dead and close what they were serving.
    fn retire_exited_workers(&mut self) {
        for (worker, handle) in self.handles.iter().enumerate() {
            if self.pool.status(worker) == WorkerStatus::Dead || !handle.has_exited() {
                continue;
            }
            if let Some(client) = self.pool.mark_dead(worker) {
                tracing::warn!(
                    connection = %client.id(),
                    worker = handle.name(),
                    "Closing client of dead worker"
                );
                half_close(&client);
            }
            metrics::record_worker_exited();
            let alive = self.pool.alive_count();
            if alive == 0 {
                tracing::error!("No worker processes left");
            } else {
                tracing::warn!(alive, "Worker pool shrank");
            }
        }
    }

    /// Queue a readable client, or turn it away when the queue is full.
    async fn enqueue(&self, ready: &mut VecDeque<ClientConnection>, mut client: ClientConnection) {
        let limit = self.config.max_pending;
        if limit > 0 && ready.len() >= limit {
            tracing::warn!(
                connection = %client.id(),
                pending = ready.len(),
                "Ready queue full, rejecting"
            );
            metrics::record_queue_overflow();
            let reply = Reply::ServiceUnavailable.to_bytes();
            let sent = send_all(client.stream_mut(), &reply, REJECT_WRITE_TIMEOUT).await;
            if sent.is_err() {
                tracing::debug!(connection = %client.id(), "Rejection not delivered");
            }
            half_close(&client);
            return;
        }
        ready.push_back(client);
    }

    /// Hand queued clients to READY workers, oldest first.
    async fn assign(&mut self, ready: &mut VecDeque<ClientConnection>) {
        while let Some(worker) = self.pool.first_ready() {
            let Some(client) = ready.pop_front() else {
                break;
            };
            let handle = &self.handles[worker];
            match handle.channel().send_descriptor(client.as_raw_fd()).await {
                Ok(()) => {
                    tracing::debug!(connection = %client.id(), worker = handle.name(), "Assigned");
                    self.pool.assign(worker, client);
                }
                Err(e) => {
                    tracing::error!(
                        connection = %client.id(),
                        worker = handle.name(),
                        error = %e,
                        "Descriptor transfer failed, closing client"
                    );
                    half_close(&client);
                }
            }
        }
    }
}

/// Drop queued clients that are no longer ESTABLISHED.
fn prune_ready(ready: &mut VecDeque<ClientConnection>) {
    ready.retain(|client| {
        if is_established(client) {
            return true;
        }
        tracing::debug!(connection = %client.id(), "Client gone while queued");
        half_close(client);
        false
    });
}

/// Wait until an idle client has bytes to read or stops being ESTABLISHED.
async fn watch(client: ClientConnection, probe_interval: Duration) -> WatchEvent {
    let mut probe = tokio::time::interval(probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    probe.tick().await;
    let mut buf = [0u8; 1];

    loop {
        tokio::select! {
            peeked = client.stream().peek(&mut buf) => {
                return match peeked {
                    Ok(n) if n > 0 => WatchEvent::Ready(client),
                    Ok(_) => WatchEvent::Closed(client),
                    Err(e) => {
                        tracing::trace!(connection = %client.id(), error = %e, "Peek failed");
                        WatchEvent::Closed(client)
                    }
                };
            }
            _ = probe.tick() => {
                if !is_established(&client) {
                    return WatchEvent::Closed(client);
                }
            }
        }
    }
}
