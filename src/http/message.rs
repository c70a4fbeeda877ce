//! Incremental HTTP/1.x message framing.
//!
//! # Responsibilities
//! - Read a header section terminated by CRLF-CRLF or LF-LF
//! - Complete the body according to `Transfer-Encoding` or `Content-Length`
//! - Keep bytes belonging to the next pipelined message as the tail
//! - Rewrite the `Connection` header in place
//!
//! # States
//! ```text
//! HeaderRead → NoBody | ContentLengthBody | ChunkedBody → Complete
//!            ↘ ReadError / Timeout (terminal)
//! ```

use std::time::Duration;

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header bytes are read in small increments so little of a pipelined
/// follow-up request is consumed.
const HEADER_CHUNK: usize = 50;
/// Upper bound of a single body read.
const BODY_CHUNK: usize = 4096;

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Header section only.
    None,
    /// Exactly this many body bytes follow the header section.
    ContentLength(usize),
    /// Chunked transfer coding; declared chunk sizes are not trusted.
    Chunked,
}

/// A framed HTTP message as read from a stream.
#[derive(Debug, Clone)]
pub struct Message {
    raw: Vec<u8>,
    header_len: usize,
    framing: Framing,
    ok: bool,
    timed_out: bool,
    tail: Vec<u8>,
}

impl Message {
    fn failed(raw: Vec<u8>, timed_out: bool) -> Self {
        Self {
            raw,
            header_len: 0,
            framing: Framing::None,
            ok: false,
            timed_out,
            tail: Vec::new(),
        }
    }

    /// Read one message from `stream`, starting from `seed` (the tail of the
    /// previous message on the same connection).
    ///
    /// `read_timeout` bounds every individual read, not the whole message.
    pub async fn read<R>(stream: &mut R, seed: Vec<u8>, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = seed;
        strip_leading_blank_lines(&mut raw);

        let mut chunk = [0u8; HEADER_CHUNK];
        let (header_len, body_start) = loop {
            if let Some(found) = find_header_end(&raw) {
                break found;
            }
            match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                Err(_) => {
                    tracing::trace!(buffered = raw.len(), "Header read timed out");
                    let timed_out = raw.is_empty();
                    return Self::failed(raw, timed_out);
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, buffered = raw.len(), "Header read failed");
                    return Self::failed(raw, false);
                }
                Ok(Ok(0)) => {
                    if raw.is_empty() {
                        // peer hung up without sending anything
                        return Self::failed(raw, true);
                    }
                    if !has_start_line(&raw) {
                        return Self::failed(raw, false);
                    }
                    tracing::debug!(buffered = raw.len(), "Peer closed before end of headers");
                    let len = raw.len();
                    break (len, len);
                }
                Ok(Ok(n)) => {
                    raw.extend_from_slice(&chunk[..n]);
                    strip_leading_blank_lines(&mut raw);
                }
            }
        };

        if !has_start_line(&raw) {
            return Self::failed(raw, false);
        }

        let framing = framing_of(&raw[..header_len]);
        let mut message = Self {
            raw,
            header_len,
            framing,
            ok: false,
            timed_out: false,
            tail: Vec::new(),
        };

        match framing {
            Framing::None => {
                message.tail = message.raw.split_off(body_start);
                message.ok = true;
            }
            Framing::ContentLength(length) => {
                message.read_sized_body(stream, body_start, length, read_timeout).await;
            }
            Framing::Chunked => {
                message.read_chunked_body(stream, body_start, read_timeout).await;
            }
        }
        message
    }

    async fn read_sized_body<R>(
        &mut self,
        stream: &mut R,
        body_start: usize,
        length: usize,
        read_timeout: Duration,
    ) where
        R: AsyncRead + Unpin,
    {
        let Some(end) = body_start.checked_add(length) else {
            tracing::warn!(length, "Content-Length out of range");
            return;
        };
        let mut chunk = vec![0u8; BODY_CHUNK];
        while self.raw.len() < end {
            let want = (end - self.raw.len()).min(BODY_CHUNK);
            match tokio::time::timeout(read_timeout, stream.read(&mut chunk[..want])).await {
                Err(_) => {
                    tracing::debug!(
                        missing = end - self.raw.len(),
                        "Body read timed out, treating buffered bytes as the whole message"
                    );
                    self.ok = true;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Body read failed");
                    return;
                }
                Ok(Ok(0)) => {
                    tracing::debug!(missing = end - self.raw.len(), "Body truncated");
                    return;
                }
                Ok(Ok(n)) => self.raw.extend_from_slice(&chunk[..n]),
            }
        }
        self.tail = self.raw.split_off(end);
        self.ok = true;
    }

    async fn read_chunked_body<R>(
        &mut self,
        stream: &mut R,
        body_start: usize,
        read_timeout: Duration,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; BODY_CHUNK];
        loop {
            if let Some(end) = find_chunked_end(&self.raw[body_start..]) {
                self.tail = self.raw.split_off(body_start + end);
                self.ok = true;
                return;
            }
            match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                Err(_) => {
                    tracing::debug!(
                        "Chunked read timed out, treating buffered bytes as the whole message"
                    );
                    self.ok = true;
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Chunked read failed");
                    return;
                }
                Ok(Ok(0)) => {
                    tracing::debug!("Chunked body truncated");
                    return;
                }
                Ok(Ok(n)) => self.raw.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Header section without its terminating blank line.
    pub fn header(&self) -> &[u8] {
        &self.raw[..self.header_len]
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Everything read for this message: header section, terminator, body.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// True when the read failed before a single byte arrived.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Bytes already read that belong to the next message.
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    pub fn into_tail(self) -> Vec<u8> {
        self.tail
    }
}

/// Replace the value of the first `Connection` header found within the first
/// `header_len` bytes of `message` with `keep-alive` or `close`.
///
/// A message without a `Connection` header is returned unchanged.
pub fn set_keep_alive(message: &[u8], header_len: usize, keep_alive: bool) -> Vec<u8> {
    let region = &message[..header_len.min(message.len())];
    let Some((start, end)) = find_header_line(region, b"connection") else {
        return message.to_vec();
    };

    let value: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
    let mut rewritten = Vec::with_capacity(message.len() + value.len());
    rewritten.extend_from_slice(&message[..start]);
    rewritten.extend_from_slice(b"connection: ");
    rewritten.extend_from_slice(value);
    rewritten.extend_from_slice(&message[end..]);
    rewritten
}

/// Locate the header terminator. Returns (header length, body start).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = memmem::find(buf, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = memmem::find(buf, b"\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn strip_leading_blank_lines(buf: &mut Vec<u8>) {
    let blank = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    if blank > 0 {
        buf.drain(..blank);
    }
}

/// A recognizable start line mentions the protocol, e.g. `GET / HTTP/1.1` or
/// `HTTP/1.1 200 OK`.
fn has_start_line(buf: &[u8]) -> bool {
    let first_line = match memchr::memchr(b'\n', buf) {
        Some(i) => &buf[..i],
        None => buf,
    };
    memmem::find(first_line, b"HTTP").is_some()
}

fn framing_of(header: &[u8]) -> Framing {
    if find_header_line(header, b"transfer-encoding").is_some() {
        return Framing::Chunked;
    }
    header_value(header, b"content-length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(Framing::ContentLength)
        .unwrap_or(Framing::None)
}

/// Iterate header lines as (start, end) offsets, `end` excluding CR and LF.
fn lines(buf: &[u8]) -> impl Iterator<Item = (usize, usize)> + '_ {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos >= buf.len() {
            return None;
        }
        let start = pos;
        let (mut end, next) = match memchr::memchr(b'\n', &buf[start..]) {
            Some(i) => (start + i, start + i + 1),
            None => (buf.len(), buf.len()),
        };
        if end > start && buf[end - 1] == b'\r' {
            end -= 1;
        }
        pos = next;
        Some((start, end))
    })
}

/// Find the header line whose name matches `name` case-insensitively.
fn find_header_line(header: &[u8], name: &[u8]) -> Option<(usize, usize)> {
    lines(header).find(|&(start, end)| {
        let line = &header[start..end];
        line.len() > name.len()
            && line[..name.len()].eq_ignore_ascii_case(name)
            && line[name.len()] == b':'
    })
}

fn header_value<'a>(header: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    find_header_line(header, name).map(|(start, end)| &header[start + name.len() + 1..end])
}

/// Find the end of a chunked body: a line holding a lone `0`, one optional
/// trailer line, then an empty line. Returns the offset just past it.
fn find_chunked_end(body: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = memmem::find(&body[from..], b"0\r\n") {
        let at = from + i;
        from = at + 1;
        if at > 0 && body[at - 1] != b'\n' {
            continue;
        }
        let after = at + 3;
        let rest = &body[after..];
        if rest.starts_with(b"\r\n") {
            return Some(after + 2);
        }
        if let Some(line_end) = memmem::find(rest, b"\r\n") {
            if rest[line_end + 2..].starts_with(b"\r\n") {
                return Some(after + line_end + 4);
            }
        }
    }
    None
}
