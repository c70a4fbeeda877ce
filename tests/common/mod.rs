//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use forward_proxy::cache::Cache;
use forward_proxy::config::{DispatcherConfig, StorageConfig, TimeoutConfig};
use forward_proxy::dispatcher::{Stats, WorkerHandle};
use forward_proxy::net::{channel_pair, Listener, TransferChannel};
use forward_proxy::{Dispatcher, Shutdown, Worker};

pub const RESOURCE_BODY: &str = "ResponseBody1";

/// Mock origin server. `/resource1` answers 200 with [`RESOURCE_BODY`],
/// anything else 404. Counts the requests it receives.
pub struct MockOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_mock_origin() -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let Some(head) = read_head(&mut socket).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = if head.contains("/resource1 ") {
                    ("200 OK", RESOURCE_BODY)
                } else {
                    ("404 Not Found", "missing")
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    MockOrigin { addr, hits }
}

/// Start an origin that echoes every byte back.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A dispatcher with in-process workers, wired through real descriptor passing.
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: Shutdown,
    dispatcher: JoinHandle<Stats>,
    workers: Vec<JoinHandle<()>>,
}

impl TestProxy {
    /// Stop the dispatcher and return its statistics.
    pub async fn stop(self) -> Stats {
        self.shutdown.trigger();
        let stats = self.dispatcher.await.unwrap();
        for worker in self.workers {
            worker.abort();
        }
        stats
    }
}

pub fn test_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        client_read_secs: 2,
        origin_connect_secs: 2,
        origin_read_secs: 2,
        tunnel_read_secs: 1,
        write_secs: 1,
    }
}

/// Start a proxy with `workers` workers, caching through `storage` if given.
pub async fn start_proxy(workers: usize, storage: Option<&StorageConfig>) -> TestProxy {
    let listener = Listener::bind("127.0.0.1", 0).unwrap();
    let addr = listener.local_addr();

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for index in 0..workers {
        let name = format!("t{index}");
        let (parent_end, child_end) = channel_pair().unwrap();
        let cache = storage.map(|s| Cache::open(s).unwrap());
        let worker = Worker::new(name.clone(), test_timeouts(), cache);
        let channel = TransferChannel::from_std(child_end).unwrap();
        tasks.push(tokio::spawn(async move {
            let _ = worker.run(channel).await;
        }));
        handles.push(WorkerHandle::new(
            name,
            None,
            TransferChannel::from_std(parent_end).unwrap(),
        ));
    }

    let shutdown = Shutdown::new();
    let dispatcher = Dispatcher::new(
        listener.into_tokio().unwrap(),
        handles,
        DispatcherConfig::default(),
    );
    let dispatcher = tokio::spawn(dispatcher.run(shutdown.subscribe()));

    TestProxy {
        addr,
        shutdown,
        dispatcher,
        workers: tasks,
    }
}

/// Read up to and including the blank line ending the header section.
async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    String::from_utf8(head).ok()
}

/// A response as seen by a test client.
#[derive(Debug)]
pub struct ClientResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn status_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }
}

/// Read one Content-Length framed response, with a timeout.
pub async fn read_response(stream: &mut TcpStream) -> ClientResponse {
    tokio::time::timeout(Duration::from_secs(5), async {
        let head = read_head(stream).await.expect("response head");
        let response = ClientResponse {
            head,
            body: Vec::new(),
        };
        let length: usize = response
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.expect("response body");
        ClientResponse { body, ..response }
    })
    .await
    .expect("response within timeout")
}

/// Connect to the proxy and send raw bytes.
pub async fn send_raw(proxy: SocketAddr, bytes: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    stream
}

pub fn get_request(origin: &MockOrigin, path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
        origin.url(path),
        origin.addr
    )
}
