//! Client connection identity and socket-level helpers.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry an accepted client socket between dispatcher and workers
//! - Query TCP state, half-close, and write whole buffers

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::socket::{shutdown, Shutdown};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// `TCP_ESTABLISHED` from the kernel's TCP state enumeration.
#[cfg(target_os = "linux")]
const TCP_ESTABLISHED: u8 = 1;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted client socket owned by the dispatcher.
///
/// The dispatcher keeps this for the whole life of the connection; workers
/// only ever hold a duplicate of the descriptor.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            stream,
            peer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl AsRawFd for ClientConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Whether the kernel still reports the socket as `ESTABLISHED`.
#[cfg(target_os = "linux")]
pub fn is_established(socket: &impl AsRawFd) -> bool {
    // SAFETY: tcp_info is plain old data and the length passed matches the buffer.
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        tracing::debug!(error = %io::Error::last_os_error(), "TCP_INFO query failed");
        return false;
    }
    info.tcpi_state == TCP_ESTABLISHED
}

/// Whether the socket still has a connected peer.
#[cfg(not(target_os = "linux"))]
pub fn is_established(socket: &impl AsRawFd) -> bool {
    nix::sys::socket::getpeername::<nix::sys::socket::SockaddrStorage>(socket.as_raw_fd()).is_ok()
}

/// Shut down the write side of a socket. Errors are ignored; the peer may be gone.
pub fn half_close(socket: &impl AsRawFd) {
    if let Err(e) = shutdown(socket.as_raw_fd(), Shutdown::Write) {
        tracing::trace!(error = %e, "Half-close failed");
    }
}

/// Write the whole buffer and flush within `limit`. An elapsed limit is
/// reported as `ErrorKind::TimedOut`.
pub async fn send_all<W>(stream: &mut W, data: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(data).await?;
        stream.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}
