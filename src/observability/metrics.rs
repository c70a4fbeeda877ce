//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter)
//! - `proxy_requests_total` (counter): requests read, by outcome
//! - `proxy_active_workers` (gauge): workers currently serving a client
//! - `proxy_queue_rejections_total` (counter): clients turned away with 503
//!
//! Recorded in the dispatcher process only; the exporter runs there too.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::worker::RequestCounters;

/// Start the Prometheus exporter. Failure is logged; the proxy keeps running.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    counter!("proxy_connections_accepted_total").increment(1);
}

/// Fold one connection's counters into the request totals.
pub fn record_connection_done(counters: &RequestCounters) {
    counter!("proxy_requests_total", "outcome" => "read").increment(counters.session);
    counter!("proxy_requests_total", "outcome" => "completed").increment(counters.complete);
    counter!("proxy_requests_total", "outcome" => "failed_read").increment(counters.failed_read);
}

pub fn record_active_workers(active: usize) {
    gauge!("proxy_active_workers").set(active as f64);
}

pub fn record_queue_overflow() {
    counter!("proxy_queue_rejections_total").increment(1);
}

/// Record a worker process that exited on its own.
pub fn record_worker_exited() {
    counter!("proxy_worker_exits_total").increment(1);
}
