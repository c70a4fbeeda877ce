//! Worker pool bookkeeping on the dispatcher side.
//!
//! # Responsibilities
//! - Track each worker's status through READY → ACTIVE → DONE_* → READY
//! - Retire workers whose process has exited
//! - Hold the client connection a worker is serving
//! - Hand finished connections back for recycling or closing
//!
//! Generic over the client type so the state machine can be tested without sockets.

use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::net::TransferChannel;
use crate::worker::{Completion, RequestCounters, WorkerReport};

/// Worker status as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Active,
    DoneOpen,
    DoneClose,
    /// The process is gone; never assigned again.
    Dead,
}

impl From<Completion> for WorkerStatus {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::DoneOpen => WorkerStatus::DoneOpen,
            Completion::DoneClose => WorkerStatus::DoneClose,
        }
    }
}

#[derive(Debug)]
struct WorkerRecord<C> {
    name: String,
    status: WorkerStatus,
    counters: RequestCounters,
    client: Option<C>,
}

/// A connection a worker has finished with.
#[derive(Debug)]
pub struct Reaped<C> {
    pub worker: usize,
    pub status: WorkerStatus,
    pub counters: RequestCounters,
    pub client: Option<C>,
}

#[derive(Debug)]
pub struct WorkerPool<C> {
    records: Vec<WorkerRecord<C>>,
}

impl<C> WorkerPool<C> {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = names
            .into_iter()
            .map(|name| WorkerRecord {
                name: name.into(),
                status: WorkerStatus::Ready,
                counters: RequestCounters::default(),
                client: None,
            })
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn name(&self, worker: usize) -> &str {
        &self.records[worker].name
    }

    pub fn status(&self, worker: usize) -> WorkerStatus {
        self.records[worker].status
    }

    /// First worker in READY state, in pool order.
    pub fn first_ready(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.status == WorkerStatus::Ready)
    }

    /// Mark `worker` ACTIVE with `client`. The descriptor must already be on its way.
    pub fn assign(&mut self, worker: usize, client: C) {
        let record = &mut self.records[worker];
        debug_assert_eq!(record.status, WorkerStatus::Ready);
        record.status = WorkerStatus::Active;
        record.client = Some(client);
    }

    /// Apply a completion report. Reports from workers that are not ACTIVE are ignored.
    pub fn record_report(&mut self, worker: usize, report: WorkerReport) -> bool {
        let Some(record) = self.records.get_mut(worker) else {
            return false;
        };
        if record.status != WorkerStatus::Active {
            tracing::warn!(
                worker = %record.name,
                status = ?record.status,
                "Unexpected report ignored"
            );
            return false;
        }
        record.counters = report.counters;
        record.status = report.status.into();
        true
    }

    /// Collect every DONE_* worker's connection and counters, resetting it to READY.
    pub fn reap(&mut self) -> Vec<Reaped<C>> {
        let mut reaped = Vec::new();
        for (worker, record) in self.records.iter_mut().enumerate() {
            if matches!(record.status, WorkerStatus::DoneOpen | WorkerStatus::DoneClose) {
                reaped.push(Reaped {
                    worker,
                    status: record.status,
                    counters: std::mem::take(&mut record.counters),
                    client: record.client.take(),
                });
                record.status = WorkerStatus::Ready;
            }
        }
        reaped
    }

    /// Retire `worker` for good, returning the connection it was serving.
    pub fn mark_dead(&mut self, worker: usize) -> Option<C> {
        let record = &mut self.records[worker];
        record.status = WorkerStatus::Dead;
        record.counters = RequestCounters::default();
        record.client.take()
    }

    pub fn alive_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status != WorkerStatus::Dead)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == WorkerStatus::Active)
            .count()
    }
}

/// The dispatcher's end of a worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: String,
    /// `None` for workers running as tasks in this process.
    pid: Option<Pid>,
    channel: Arc<TransferChannel>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, pid: Option<Pid>, channel: TransferChannel) -> Self {
        Self {
            name: name.into(),
            pid,
            channel: Arc::new(channel),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<TransferChannel> {
        &self.channel
    }

    /// Whether the worker process has exited. Collects its exit status if so.
    /// Always `false` for in-process workers.
    pub fn has_exited(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::error!(worker = %self.name, %pid, code, "Worker exited");
                true
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::error!(worker = %self.name, %pid, ?signal, "Worker killed");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(worker = %self.name, %pid, error = %e, "Worker status unavailable");
                false
            }
        }
    }

    /// Stop a forked worker and reap it.
    pub fn terminate(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::warn!(worker = %self.name, %pid, error = %e, "Failed to signal worker");
            return;
        }
        if let Err(e) = waitpid(pid, None) {
            tracing::warn!(worker = %self.name, %pid, error = %e, "Failed to reap worker");
        }
    }
}

/// A forked worker's parent-side pieces, before the runtime exists.
#[derive(Debug)]
pub struct ForkedWorker {
    pub name: String,
    pub pid: Pid,
    pub channel: StdUnixDatagram,
}
