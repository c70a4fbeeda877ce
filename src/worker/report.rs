//! Completion reports sent from a worker back to the dispatcher.

use serde::{Deserialize, Serialize};

/// How a worker finished with a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    /// The client may send more requests; watch the socket again.
    DoneOpen,
    /// The connection is finished; the dispatcher closes it.
    DoneClose,
}

/// Per-connection request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounters {
    /// Requests read (including ones that failed to parse).
    pub session: u64,
    /// Requests answered with an origin or cached response.
    pub complete: u64,
    /// Requests that could not be read or were rejected.
    pub failed_read: u64,
}

impl RequestCounters {
    pub fn merge(&mut self, other: &RequestCounters) {
        self.session += other.session;
        self.complete += other.complete;
        self.failed_read += other.failed_read;
    }
}

/// Sent once per connection, after all counter updates for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: Completion,
    pub counters: RequestCounters,
}
