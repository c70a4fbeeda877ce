//! End-to-end behaviour through the dispatcher and workers.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::*;
use forward_proxy::config::{StorageConfig, StorageKind};

fn fs_storage(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        storage: StorageKind::Fs,
        enable_cache: true,
        cache_discard_after: 3600,
        cache_path: dir.join("cache"),
        db_path: dir.join("cache.db"),
    }
}

#[tokio::test]
async fn cached_response_is_served_without_origin() {
    let origin = start_mock_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = fs_storage(dir.path());
    let proxy = start_proxy(2, Some(&storage)).await;

    let mut client = send_raw(proxy.addr, get_request(&origin, "/resource1").as_bytes()).await;
    let first = read_response(&mut client).await;
    assert_eq!(first.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(first.header("connection"), Some("keep-alive"));
    assert_eq!(first.body, RESOURCE_BODY.as_bytes());
    assert_eq!(origin.hits(), 1);

    // a second client asks again; the origin must not see it
    let mut other = send_raw(proxy.addr, get_request(&origin, "/resource1").as_bytes()).await;
    let second = read_response(&mut other).await;
    assert_eq!(second.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(second.body, RESOURCE_BODY.as_bytes());
    assert_eq!(origin.hits(), 1);

    let stats = proxy.stop().await;
    assert_eq!(stats.totals().failed_read, 0);
}

#[tokio::test]
async fn database_cache_serves_repeat_requests() {
    let origin = start_mock_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        storage: StorageKind::Db,
        ..fs_storage(dir.path())
    };
    let proxy = start_proxy(1, Some(&storage)).await;

    let mut client = send_raw(proxy.addr, get_request(&origin, "/resource1").as_bytes()).await;
    assert_eq!(read_response(&mut client).await.body, RESOURCE_BODY.as_bytes());

    client
        .write_all(get_request(&origin, "/resource1").as_bytes())
        .await
        .unwrap();
    let repeat = read_response(&mut client).await;
    assert_eq!(repeat.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(repeat.body, RESOURCE_BODY.as_bytes());
    assert_eq!(origin.hits(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_origin_answers_502_and_keeps_connection() {
    let origin = start_mock_origin().await;
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let proxy = start_proxy(1, None).await;

    let request = format!("GET http://127.0.0.1:{dead_port}/x HTTP/1.1\r\nHost: x\r\n\r\n");
    let mut client = send_raw(proxy.addr, request.as_bytes()).await;
    let failed = read_response(&mut client).await;
    assert_eq!(failed.status_line(), "HTTP/1.1 502 Bad Gateway");
    assert!(failed.body.is_empty());

    // same connection, next request goes through
    client
        .write_all(get_request(&origin, "/resource1").as_bytes())
        .await
        .unwrap();
    let next = read_response(&mut client).await;
    assert_eq!(next.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(next.body, RESOURCE_BODY.as_bytes());

    proxy.stop().await;
}

#[tokio::test]
async fn unsupported_method_answers_501_and_closes() {
    let proxy = start_proxy(1, None).await;

    let mut client = send_raw(proxy.addr, b"POST http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 501 Not Implemented\r\n"));

    let stats = proxy.stop().await;
    assert_eq!(stats.totals().failed_read, 1);
    assert_eq!(stats.totals().session, 1);
    assert_eq!(stats.totals().complete, 0);
}

#[tokio::test]
async fn connect_relays_raw_bytes() {
    let echo = start_echo_server().await;
    let proxy = start_proxy(1, None).await;

    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    let mut client = send_raw(proxy.addr, request.as_bytes()).await;

    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    let mut reply = vec![0u8; established.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, established);

    client.write_all(b"opaque bytes").await.unwrap();
    let mut echoed = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"opaque bytes");

    proxy.stop().await;
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let origin = start_mock_origin().await;
    let proxy = start_proxy(1, None).await;

    let both = format!(
        "{}{}",
        get_request(&origin, "/resource1"),
        get_request(&origin, "/elsewhere")
    );
    let mut client = send_raw(proxy.addr, both.as_bytes()).await;

    let first = read_response(&mut client).await;
    let second = read_response(&mut client).await;
    assert_eq!(first.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(second.status_line(), "HTTP/1.1 404 Not Found");
    assert_eq!(origin.hits(), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn non_200_responses_are_not_cached() {
    let origin = start_mock_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = fs_storage(dir.path());
    let proxy = start_proxy(1, Some(&storage)).await;

    for _ in 0..2 {
        let mut client = send_raw(proxy.addr, get_request(&origin, "/elsewhere").as_bytes()).await;
        let response = read_response(&mut client).await;
        assert_eq!(response.status_line(), "HTTP/1.1 404 Not Found");
    }
    assert_eq!(origin.hits(), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn works_as_http_proxy_for_reqwest() {
    let origin = start_mock_origin().await;
    let proxy = start_proxy(2, None).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy.addr)).unwrap())
        .build()
        .unwrap();
    let response = client.get(origin.url("/resource1")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), RESOURCE_BODY);

    proxy.stop().await;
}
