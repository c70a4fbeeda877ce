//! Listening socket setup.
//!
//! # Responsibilities
//! - Bind to the address and port given on the command line
//! - Hand a std listener to the parent process before workers fork
//! - Convert into a Tokio listener once the runtime exists

use std::net::{SocketAddr, TcpListener as StdTcpListener};

use nix::sys::socket::{listen, Backlog};
use thiserror::Error;
use tokio::net::TcpListener;

/// Pending-connection queue length for the listening socket.
const BACKLOG: i32 = 32;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to register the socket with the runtime.
    #[error("failed to register listener: {0}")]
    Register(#[source] std::io::Error),
}

/// A bound listening socket that has not been registered with a runtime yet.
///
/// Binding happens before the worker processes fork, so this wraps the
/// blocking std type. `SO_REUSEADDR` is set by std on Unix; the backlog is
/// narrowed to 32 after binding.
#[derive(Debug)]
pub struct Listener {
    inner: StdTcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub fn bind(address: &str, port: u16) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            address: format!("{address}:{port}"),
            source,
        };
        let inner = StdTcpListener::bind((address, port)).map_err(bind_error)?;
        let local_addr = inner.local_addr().map_err(bind_error)?;
        // listening again on Linux only resizes the accept queue
        Backlog::new(BACKLOG)
            .and_then(|backlog| listen(&inner, backlog))
            .map_err(|errno| bind_error(errno.into()))?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self { inner, local_addr })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register with the current Tokio runtime.
    pub fn into_tokio(self) -> Result<TcpListener, ListenerError> {
        self.inner
            .set_nonblocking(true)
            .map_err(ListenerError::Register)?;
        TcpListener::from_std(self.inner).map_err(ListenerError::Register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = Listener::bind("127.0.0.1", 0).unwrap();
        let err = Listener::bind("127.0.0.1", first.local_addr().port()).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[tokio::test]
    async fn registers_with_runtime() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr();
        let listener = listener.into_tokio().unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
    }
}
