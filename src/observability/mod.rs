//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, console + proxy.log)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log file shared by dispatcher and workers
//!     → Metrics endpoint (Prometheus scrape), when configured
//! ```
//!
//! # Design Decisions
//! - Each worker logs inside its own span instead of taking a shared lock
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
