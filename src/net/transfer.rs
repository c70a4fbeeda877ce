//! Descriptor transfer channel between the dispatcher and a worker.
//!
//! Each worker owns one end of an `AF_UNIX` datagram socket pair. The
//! dispatcher sends client sockets down as `SCM_RIGHTS` ancillary data; the
//! worker sends completion reports back up as JSON datagrams.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixDatagram;

/// Data byte carried alongside each descriptor.
const DESCRIPTOR_MARKER: u8 = b'X';

const REPORT_BUF: usize = 1024;

/// Error type for channel operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed report: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("datagram carried no descriptor")]
    MissingDescriptor,

    #[error("peer closed the channel")]
    Closed,
}

/// Create the two ends of a channel. Call before forking.
pub fn channel_pair() -> io::Result<(StdUnixDatagram, StdUnixDatagram)> {
    StdUnixDatagram::pair()
}

#[derive(Debug)]
pub struct TransferChannel {
    socket: UnixDatagram,
}

impl TransferChannel {
    /// Register one end of a pair with the current runtime.
    pub fn from_std(socket: StdUnixDatagram) -> Result<Self, TransferError> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UnixDatagram::from_std(socket)?,
        })
    }

    /// Send a duplicate of `fd` to the other end. The caller keeps its own copy.
    pub async fn send_descriptor(&self, fd: RawFd) -> Result<(), TransferError> {
        let fds = [fd];
        let marker = [DESCRIPTOR_MARKER];
        self.socket
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&marker)];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(
                    self.socket.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)
            })
            .await?;
        Ok(())
    }

    /// Wait for the next descriptor.
    pub async fn receive_descriptor(&self) -> Result<OwnedFd, TransferError> {
        let (bytes, fd) = self
            .socket
            .async_io(Interest::READABLE, || {
                let mut marker = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut marker)];
                let mut space = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let mut received: Option<OwnedFd> = None;
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            // SAFETY: SCM_RIGHTS installs fresh descriptors owned by this process.
                            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                            if received.is_none() {
                                received = Some(owned);
                            }
                        }
                    }
                }
                Ok((msg.bytes, received))
            })
            .await?;

        match fd {
            Some(fd) => Ok(fd),
            None if bytes == 0 => Err(TransferError::Closed),
            None => Err(TransferError::MissingDescriptor),
        }
    }

    pub async fn send_report<T: Serialize>(&self, report: &T) -> Result<(), TransferError> {
        let encoded = serde_json::to_vec(report)?;
        self.socket.send(&encoded).await?;
        Ok(())
    }

    pub async fn receive_report<T: DeserializeOwned>(&self) -> Result<T, TransferError> {
        let mut buf = [0u8; REPORT_BUF];
        let n = self.socket.recv(&mut buf).await?;
        if n == 0 {
            return Err(TransferError::Closed);
        }
        Ok(serde_json::from_slice(&buf[..n])?)
    }
}
