//! Request classification and cache-key derivation.

use std::time::Duration;

use tokio::io::AsyncRead;

use crate::http::message::Message;

/// Methods the proxy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Connect,
    /// Anything else, including a request that could not be read.
    Other,
}

/// A client request read from the wire.
#[derive(Debug)]
pub struct Request {
    message: Message,
    method: Method,
    method_token: String,
    hostname: String,
    cache_key: String,
}

impl Request {
    /// Read and classify the next request, starting from `seed`.
    pub async fn read<R>(stream: &mut R, seed: Vec<u8>, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin,
    {
        Self::from_message(Message::read(stream, seed, read_timeout).await)
    }

    pub fn from_message(message: Message) -> Self {
        let mut request = Self {
            message,
            method: Method::Other,
            method_token: String::new(),
            hostname: String::new(),
            cache_key: String::new(),
        };

        let tokens: Vec<&[u8]> = request
            .message
            .raw()
            .split(|b| b.is_ascii_whitespace())
            .filter(|t| !t.is_empty())
            .take(2)
            .collect();
        if !request.message.is_ok() || tokens.len() < 2 {
            return request;
        }

        let method = match tokens[0] {
            b"GET" => Method::Get,
            b"CONNECT" => Method::Connect,
            _ => Method::Other,
        };
        request.method_token = String::from_utf8_lossy(tokens[0]).into_owned();

        let mut target = String::from_utf8_lossy(tokens[1]).into_owned();
        if let Some(rest) = target.strip_prefix("http://") {
            target = rest.to_string();
        } else if method != Method::Connect && target.starts_with("https://") {
            // TLS must go through CONNECT
            return request;
        }
        let target = target.trim_start_matches('/').replace("/..", "");

        let (hostname, resource) = match target.split_once('/') {
            Some((host, path)) => (host, path),
            None => (target.as_str(), ""),
        };
        let mut cache_key = format!("{hostname}/{resource}");
        if cache_key.ends_with('/') {
            cache_key.push_str("default");
        }

        request.method = method;
        request.hostname = hostname.to_string();
        request.cache_key = cache_key;
        request
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// First token of the request line, as sent (for diagnostics).
    pub fn method_token(&self) -> &str {
        &self.method_token
    }

    /// `host[:port]` of the request target.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
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

    pub fn into_tail(self) -> Vec<u8> {
        self.message.into_tail()
    }
}
