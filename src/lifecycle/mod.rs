//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Init logging → Bind → Prepare storage → Fork workers → Runtime → Dispatcher
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Dispatcher stops → Statistics logged → Workers terminated
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then storage, then workers, then traffic
//! - Workers hold no state worth draining; they are terminated, not drained

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::StartupError;
