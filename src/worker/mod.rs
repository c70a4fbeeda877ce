//! Connection workers.
//!
//! # Data Flow
//! ```text
//! TransferChannel::receive_descriptor
//!     → TcpStream (duplicate of the dispatcher's socket)
//!     → lifecycle.rs (pipelined GET / CONNECT / reject)
//!     → TCP state check
//!     → TransferChannel::send_report (DoneOpen | DoneClose + counters)
//! ```
//!
//! # Design Decisions
//! - One connection in flight per worker; parallelism comes from the pool size
//! - Counters live in the worker and travel as a snapshot with the report
//! - A worker never closes the client socket; the dispatcher does

pub mod lifecycle;
pub mod report;
pub mod tunnel;

use std::io;
use std::os::fd::OwnedFd;

use tokio::net::TcpStream;
use tracing::Instrument;

use crate::cache::Cache;
use crate::config::{ProxyConfig, TimeoutConfig};
use crate::net::{is_established, TransferChannel, TransferError};

pub use lifecycle::Disposition;
pub use report::{Completion, RequestCounters, WorkerReport};

pub struct Worker {
    timeouts: TimeoutConfig,
    cache: Option<Cache>,
    span: tracing::Span,
}

impl Worker {
    pub fn new(name: impl Into<String>, timeouts: TimeoutConfig, cache: Option<Cache>) -> Self {
        let name = name.into();
        let span = tracing::info_span!("worker", name = %name);
        Self {
            timeouts,
            cache,
            span,
        }
    }

    /// Build a worker from configuration. A cache that cannot be opened disables caching.
    pub fn from_config(name: impl Into<String>, config: &ProxyConfig) -> Self {
        let name = name.into();
        let cache = if config.storage.enable_cache {
            match Cache::open(&config.storage) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    tracing::warn!(
                        worker = %name,
                        error = %e,
                        "Cache unavailable, serving without it"
                    );
                    None
                }
            }
        } else {
            None
        };
        Self::new(name, config.timeouts.clone(), cache)
    }

    /// Serve connections handed over on `channel` until it fails.
    pub async fn run(self, channel: TransferChannel) -> Result<(), TransferError> {
        let span = self.span.clone();
        self.serve_forever(&channel).instrument(span).await
    }

    async fn serve_forever(&self, channel: &TransferChannel) -> Result<(), TransferError> {
        tracing::info!(caching = self.cache.is_some(), "Worker ready");
        loop {
            let fd = match channel.receive_descriptor().await {
                Ok(fd) => fd,
                Err(TransferError::MissingDescriptor) => {
                    tracing::warn!("Datagram without descriptor ignored");
                    continue;
                }
                Err(e) => {
                    tracing::info!(error = %e, "Channel closed, worker exiting");
                    return Err(e);
                }
            };

            let report = self.handle(fd).await;
            channel.send_report(&report).await?;
        }
    }

    /// Run the lifecycle on one handed-over socket and build its report.
    pub async fn handle(&self, fd: OwnedFd) -> WorkerReport {
        let mut counters = RequestCounters::default();
        let status = match client_stream(fd) {
            Ok(mut client) => {
                let peer = client.peer_addr().ok();
                tracing::debug!(peer = ?peer, "Serving connection");
                let disposition = self.serve(&mut client, &mut counters).await;
                if disposition == Disposition::KeepOpen && is_established(&client) {
                    Completion::DoneOpen
                } else {
                    Completion::DoneClose
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Received descriptor is not a usable socket");
                Completion::DoneClose
            }
        };

        tracing::debug!(
            status = ?status,
            session = counters.session,
            complete = counters.complete,
            failed_read = counters.failed_read,
            "Connection handed back"
        );
        WorkerReport { status, counters }
    }
}

fn client_stream(fd: OwnedFd) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::{StorageConfig, StorageKind};

    fn quick_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            client_read_secs: 1,
            origin_connect_secs: 1,
            origin_read_secs: 1,
            tunnel_read_secs: 1,
            write_secs: 1,
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn read_available(stream: &mut TcpStream) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(300), stream.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    #[tokio::test]
    async fn unsupported_method_closes() {
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (mut client, mut served) = connected_pair().await;
        client.write_all(b"POST http://a/ HTTP/1.1\r\n\r\n").await.unwrap();

        let mut counters = RequestCounters::default();
        let disposition = worker.serve(&mut served, &mut counters).await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.session, 1);
        assert_eq!(counters.failed_read, 1);
        let reply = read_available(&mut client).await;
        assert!(reply.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn idle_client_gets_request_timeout() {
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (mut client, mut served) = connected_pair().await;

        let mut counters = RequestCounters::default();
        let disposition = worker.serve(&mut served, &mut counters).await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters, RequestCounters::default());
        let reply = read_available(&mut client).await;
        assert!(reply.starts_with(b"HTTP/1.1 408 Request Timeout\r\n"));
    }

    #[tokio::test]
    async fn unreachable_origin_keeps_connection() {
        // bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (mut client, mut served) = connected_pair().await;
        let request = format!("GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: a\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut counters = RequestCounters::default();
        let disposition = worker.serve(&mut served, &mut counters).await;

        assert_eq!(disposition, Disposition::KeepOpen);
        assert_eq!(counters.session, 1);
        assert_eq!(counters.complete, 0);
        let reply = read_available(&mut client).await;
        assert_eq!(reply, b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn handle_reports_closed_peer() {
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (client, served) = connected_pair().await;
        drop(client);

        let fd = served.into_std().unwrap().into();
        let report = worker.handle(fd).await;
        assert_eq!(report.status, Completion::DoneClose);
    }

    /// Start an origin that reads one request head, then hands the socket to `respond`.
    async fn one_shot_origin<F, Fut>(respond: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            respond(socket).await;
        });
        port
    }

    fn get_from(port: u16) -> String {
        format!("GET http://127.0.0.1:{port}/x HTTP/1.1\r\nHost: a\r\n\r\n")
    }

    async fn serve_request(
        worker: &Worker,
        request: &[u8],
    ) -> (Disposition, RequestCounters, Vec<u8>) {
        let (mut client, mut served) = connected_pair().await;
        client.write_all(request).await.unwrap();
        let mut counters = RequestCounters::default();
        let disposition = worker.serve(&mut served, &mut counters).await;
        let reply = read_available(&mut client).await;
        (disposition, counters, reply)
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (disposition, counters, reply) = serve_request(&worker, b"garbage\r\n\r\n").await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.session, 1);
        assert_eq!(counters.failed_read, 1);
        assert_eq!(reply, b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn out_of_range_content_length_gets_400() {
        let worker = Worker::new("t0", quick_timeouts(), None);
        let request = b"GET http://a/ HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nxyz";
        let (disposition, counters, reply) = serve_request(&worker, request).await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.failed_read, 1);
        assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn silent_origin_gets_504() {
        let port = one_shot_origin(|socket| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(socket);
        })
        .await;
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (disposition, counters, reply) = serve_request(&worker, get_from(port).as_bytes())
            .await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.complete, 0);
        assert!(reply.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[tokio::test]
    async fn origin_closing_without_reply_gets_504() {
        let port = one_shot_origin(|socket| async move { drop(socket) }).await;
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (disposition, _, reply) = serve_request(&worker, get_from(port).as_bytes())
            .await;

        assert_eq!(disposition, Disposition::Close);
        assert!(reply.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[tokio::test]
    async fn truncated_origin_response_gets_598() {
        let port = one_shot_origin(|mut socket| async move {
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await;
        })
        .await;
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (disposition, counters, reply) = serve_request(&worker, get_from(port).as_bytes())
            .await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.complete, 0);
        assert!(reply.starts_with(b"HTTP/1.1 598 Network read timeout error\r\n"));
    }

    #[tokio::test]
    async fn refused_tunnel_gets_502_and_closes() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let worker = Worker::new("t0", quick_timeouts(), None);
        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n");
        let (disposition, counters, reply) = serve_request(&worker, request.as_bytes()).await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.session, 1);
        assert_eq!(reply, b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn unreadable_cache_entry_gets_500() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            storage: StorageKind::Db,
            enable_cache: true,
            cache_discard_after: 3600,
            cache_path: dir.path().join("cache"),
            db_path: dir.path().join("cache.db"),
        };
        let cache = Cache::open(&storage).unwrap();
        // a fresh row whose content is not a blob
        rusqlite::Connection::open(&storage.db_path)
            .unwrap()
            .execute(
                "INSERT INTO files (url, timestamp, content)
                 VALUES ('cachehost/page', CAST(strftime('%s', 'now') AS INTEGER), 42)",
                [],
            )
            .unwrap();

        let worker = Worker::new("t0", quick_timeouts(), Some(cache));
        let request = b"GET http://cachehost/page HTTP/1.1\r\nHost: cachehost\r\n\r\n";
        let (disposition, counters, reply) = serve_request(&worker, request).await;

        assert_eq!(disposition, Disposition::Close);
        assert_eq!(counters.complete, 0);
        assert_eq!(reply, b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn client_that_never_reads_releases_worker() {
        const BODY: usize = 32 * 1024 * 1024;
        let port = one_shot_origin(|mut socket| async move {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {BODY}\r\n\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&vec![b'x'; BODY]).await;
        })
        .await;
        let worker = Worker::new("t0", quick_timeouts(), None);
        let (mut client, mut served) = connected_pair().await;
        client.write_all(get_from(port).as_bytes()).await.unwrap();

        let mut counters = RequestCounters::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(15),
            worker.serve(&mut served, &mut counters),
        )
        .await;

        assert_eq!(outcome.unwrap(), Disposition::Close);
        assert_eq!(counters.complete, 0);
        drop(client);
    }
}
