//! Outbound connections to origin servers.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

/// Default port for plain HTTP origins.
pub const HTTP_PORT: u16 = 80;

/// Default port for CONNECT targets.
pub const HTTPS_PORT: u16 = 443;

/// Split `host[:port]` into its parts, falling back to `default_port`.
///
/// Bracketed IPv6 literals (`[::1]:8080`) are unwrapped.
pub fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        _ => (authority.to_string(), default_port),
    }
}

/// Connect to `authority`, bounded by `connect_timeout`.
pub async fn connect(
    authority: &str,
    default_port: u16,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let (host, port) = split_host_port(authority, default_port);
    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host"));
    }

    match tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {host}:{port} timed out"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_authorities() {
        assert_eq!(split_host_port("example.com", 80), ("example.com".into(), 80));
        assert_eq!(split_host_port("example.com:8080", 80), ("example.com".into(), 8080));
        assert_eq!(split_host_port("example.com:443", 80), ("example.com".into(), 443));
        assert_eq!(split_host_port("[::1]:9000", 80), ("::1".into(), 9000));
        assert_eq!(split_host_port("[::1]", 443), ("::1".into(), 443));
        assert_eq!(split_host_port("example.com:x", 80), ("example.com".into(), 80));
    }

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect(&format!("127.0.0.1:{port}"), HTTP_PORT, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn empty_host_is_rejected() {
        let err = connect("", HTTP_PORT, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
