//! Origin responses and responses the proxy synthesizes itself.

use std::time::Duration;

use tokio::io::AsyncRead;

use crate::http::message::{set_keep_alive, Message};

/// A response read from an origin server.
#[derive(Debug)]
pub struct Response {
    message: Message,
    status: u16,
}

impl Response {
    pub async fn read<R>(stream: &mut R, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin,
    {
        Self::from_message(Message::read(stream, Vec::new(), read_timeout).await)
    }

    pub fn from_message(message: Message) -> Self {
        let mut response = Self { message, status: 0 };
        if !response.message.is_ok() {
            return response;
        }

        let (status_line, _) = split_status_line(response.message.raw());
        let code = status_line
            .split(|b| *b == b' ')
            .filter(|t| !t.is_empty())
            .nth(1)
            .and_then(|t| std::str::from_utf8(t).ok())
            .and_then(|t| t.trim().parse::<u16>().ok());
        match code {
            Some(code) => response.status = code,
            None => tracing::warn!(
                status_line = %String::from_utf8_lossy(status_line),
                "Malformed status line"
            ),
        }
        response
    }

    /// Status code, or 0 when the status line could not be parsed.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.message.is_ok()
    }

    pub fn timed_out(&self) -> bool {
        self.message.timed_out()
    }

    /// The raw response with its `Connection` header set to `keep-alive`, so
    /// the client keeps pipelining regardless of what the origin said.
    pub fn keep_alive_bytes(&self) -> Vec<u8> {
        set_keep_alive(self.message.raw(), self.message.header_len(), true)
    }
}

/// Split a message into its first line and everything after that line.
pub fn split_status_line(raw: &[u8]) -> (&[u8], &[u8]) {
    match memchr::memchr(b'\n', raw) {
        Some(i) => {
            let line = &raw[..i];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            (line, &raw[i + 1..])
        }
        None => (raw, &[]),
    }
}

/// Rebuild a full response from a cached payload (headers and body without
/// the status line).
pub fn with_ok_status(payload: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(payload.len() + 17);
    response.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    response.extend_from_slice(payload);
    response
}

/// Responses the proxy answers with on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    ConnectionEstablished,
    BadRequest,
    RequestTimeout,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    NetworkReadTimeout,
}

impl Reply {
    pub fn code(self) -> u16 {
        match self {
            Reply::ConnectionEstablished => 200,
            Reply::BadRequest => 400,
            Reply::RequestTimeout => 408,
            Reply::InternalServerError => 500,
            Reply::NotImplemented => 501,
            Reply::BadGateway => 502,
            Reply::ServiceUnavailable => 503,
            Reply::GatewayTimeout => 504,
            Reply::NetworkReadTimeout => 598,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Reply::ConnectionEstablished => "Connection Established",
            Reply::BadRequest => "Bad Request",
            Reply::RequestTimeout => "Request Timeout",
            Reply::InternalServerError => "Internal Server Error",
            Reply::NotImplemented => "Not Implemented",
            Reply::BadGateway => "Bad Gateway",
            Reply::ServiceUnavailable => "Service Unavailable",
            Reply::GatewayTimeout => "Gateway Timeout",
            Reply::NetworkReadTimeout => "Network read timeout error",
        }
    }

    /// Status line plus minimal headers, empty body.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            // a tunnel carries no framed body
            Reply::ConnectionEstablished => {
                format!("HTTP/1.1 {} {}\r\n\r\n", self.code(), self.reason()).into_bytes()
            }
            _ => format!(
                "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n",
                self.code(),
                self.reason()
            )
            .into_bytes(),
        }
    }
}
