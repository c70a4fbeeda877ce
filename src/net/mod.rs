//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind before fork, register with the runtime after)
//!     → connection.rs (ClientConnection owned by the dispatcher)
//!     → transfer.rs (descriptor passed to a worker over SCM_RIGHTS)
//!     → origin.rs (worker connects to the origin server)
//! ```
//!
//! # Design Decisions
//! - The dispatcher owns every client socket; workers hold duplicates
//! - TCP state is read from the kernel rather than inferred from I/O errors
//! - Every outbound connect is bounded by a timeout

pub mod connection;
pub mod listener;
pub mod origin;
pub mod transfer;

pub use connection::{half_close, is_established, send_all, ClientConnection, ConnectionId};
pub use listener::{Listener, ListenerError};
pub use transfer::{channel_pair, TransferChannel, TransferError};
