//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client socket (handed over by the dispatcher)
//!     → message.rs (incremental read: headers, then Content-Length or chunked body)
//!     → request.rs (method, hostname, cache key)
//!     → [worker fetches from cache or origin]
//!     → response.rs (status, keep-alive rewrite, synthesized replies)
//!     → client socket
//! ```
//!
//! # Design Decisions
//! - Messages are kept as raw bytes; only what the proxy needs is parsed
//! - Bytes read past the end of a message are carried into the next read
//! - Read failures are values on the message, never errors

pub mod message;
pub mod request;
pub mod response;

pub use message::{set_keep_alive, Framing, Message};
pub use request::{Method, Request};
pub use response::{Reply, Response};
