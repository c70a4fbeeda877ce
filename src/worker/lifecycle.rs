//! Request lifecycle on one client connection.
//!
//! ```text
//! AWAIT_REQUEST ─┬─ unsupported ─→ 501, terminate
//!                ├─ CONNECT ─────→ tunnel, terminate
//!                └─ GET ─────────→ cache or origin ─→ continue | terminate
//! continue with buffered bytes ─→ AWAIT_REQUEST (pipelined)
//! ```

use std::time::Duration;

use tokio::net::TcpStream;

use crate::cache::Lookup;
use crate::http::response::{split_status_line, with_ok_status};
use crate::http::{set_keep_alive, Method, Reply, Request, Response};
use crate::net::origin::{self, HTTPS_PORT, HTTP_PORT};
use crate::net::{half_close, send_all};
use crate::worker::report::RequestCounters;
use crate::worker::{tunnel, Worker};

/// What the dispatcher should do with the connection afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    Close,
}

/// Outcome of a single request.
#[derive(Debug)]
enum Step {
    /// Keep the connection; carries bytes already read past this request.
    Continue(Vec<u8>),
    Terminate,
}

impl Worker {
    /// Serve every request the client has pipelined, then decide the connection's fate.
    pub async fn serve(
        &self,
        client: &mut TcpStream,
        counters: &mut RequestCounters,
    ) -> Disposition {
        let mut seed = Vec::new();
        let mut depth = 0usize;
        loop {
            match self.serve_one(client, seed, counters).await {
                Step::Continue(tail) if tail.is_empty() => return Disposition::KeepOpen,
                Step::Continue(tail) => {
                    depth += 1;
                    tracing::debug!(depth, buffered = tail.len(), "Pipelined request");
                    seed = tail;
                }
                Step::Terminate => return Disposition::Close,
            }
        }
    }

    async fn serve_one(
        &self,
        client: &mut TcpStream,
        seed: Vec<u8>,
        counters: &mut RequestCounters,
    ) -> Step {
        let request = Request::read(client, seed, self.timeouts.client_read()).await;

        if !request.is_ok() {
            if request.timed_out() {
                tracing::debug!("Client read timed out");
                send_reply(client, Reply::RequestTimeout, self.timeouts.write()).await;
            } else {
                counters.failed_read += 1;
                counters.session += 1;
                tracing::warn!("Malformed request");
                send_reply(client, Reply::BadRequest, self.timeouts.write()).await;
            }
            return Step::Terminate;
        }
        counters.session += 1;

        match request.method() {
            Method::Get => self.serve_get(client, request, counters).await,
            Method::Connect => {
                self.tunnel(client, request).await;
                Step::Terminate
            }
            Method::Other => {
                counters.failed_read += 1;
                tracing::info!(method = request.method_token(), "Unsupported method");
                send_reply(client, Reply::NotImplemented, self.timeouts.write()).await;
                Step::Terminate
            }
        }
    }

    async fn serve_get(
        &self,
        client: &mut TcpStream,
        request: Request,
        counters: &mut RequestCounters,
    ) -> Step {
        let outgoing = set_keep_alive(
            request.message().raw(),
            request.message().header_len(),
            false,
        );
        let key = request.cache_key().to_string();
        let hostname = request.hostname().to_string();
        let tail = request.into_tail();

        if let Some(cache) = &self.cache {
            match cache.lookup(&key) {
                Lookup::Hit(payload) => {
                    let hit = with_ok_status(&payload);
                    if let Err(e) = send_all(client, &hit, self.timeouts.write()).await {
                        tracing::debug!(error = %e, "Client send failed");
                        return Step::Terminate;
                    }
                    counters.complete += 1;
                    tracing::info!(key = %key, "Served from cache");
                    return Step::Continue(tail);
                }
                Lookup::Unreadable => {
                    send_reply(client, Reply::InternalServerError, self.timeouts.write()).await;
                    return Step::Terminate;
                }
                Lookup::Miss => {}
            }
        }

        let mut upstream =
            match origin::connect(&hostname, HTTP_PORT, self.timeouts.origin_connect()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(host = %hostname, error = %e, "Origin connect failed");
                    return bad_gateway(client, tail, self.timeouts.write()).await;
                }
            };
        if let Err(e) = send_all(&mut upstream, &outgoing, self.timeouts.write()).await {
            tracing::warn!(host = %hostname, error = %e, "Origin send failed");
            return bad_gateway(client, tail, self.timeouts.write()).await;
        }

        let response = Response::read(&mut upstream, self.timeouts.origin_read()).await;
        half_close(&upstream);
        drop(upstream);

        if !response.is_ok() {
            let reply = if response.timed_out() {
                Reply::GatewayTimeout
            } else {
                Reply::NetworkReadTimeout
            };
            tracing::warn!(host = %hostname, code = reply.code(), "Origin response incomplete");
            send_reply(client, reply, self.timeouts.write()).await;
            return Step::Terminate;
        }

        let forwarded = response.keep_alive_bytes();
        if let Err(e) = send_all(client, &forwarded, self.timeouts.write()).await {
            tracing::debug!(error = %e, "Client send failed");
            return Step::Terminate;
        }
        counters.complete += 1;
        tracing::info!(key = %key, status = response.status(), "Served from origin");

        if let Some(cache) = &self.cache {
            if response.status() == 200 {
                let (_, payload) = split_status_line(&forwarded);
                cache.store_if_absent(&key, payload);
            }
        }
        Step::Continue(tail)
    }

    async fn tunnel(&self, client: &mut TcpStream, request: Request) {
        let hostname = request.hostname().to_string();
        let tail = request.into_tail();

        let mut upstream =
            match origin::connect(&hostname, HTTPS_PORT, self.timeouts.origin_connect()).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(host = %hostname, error = %e, "Tunnel connect failed");
                    send_reply(client, Reply::BadGateway, self.timeouts.write()).await;
                    return;
                }
            };
        if send_all(client, &Reply::ConnectionEstablished.to_bytes(), self.timeouts.write())
            .await
            .is_err()
        {
            return;
        }
        if !tail.is_empty()
            && send_all(&mut upstream, &tail, self.timeouts.write())
                .await
                .is_err()
        {
            return;
        }

        tracing::info!(host = %hostname, "Tunnel opened");
        let (up, down) = tunnel::relay(
            client,
            &mut upstream,
            self.timeouts.tunnel_read(),
            self.timeouts.write(),
        )
        .await;
        half_close(&upstream);
        tracing::info!(host = %hostname, up, down, "Tunnel closed");
    }
}

/// Answer 502 and keep the connection if the client is still there.
async fn bad_gateway(client: &mut TcpStream, tail: Vec<u8>, limit: Duration) -> Step {
    if send_reply(client, Reply::BadGateway, limit).await {
        Step::Continue(tail)
    } else {
        Step::Terminate
    }
}

/// Send a synthesized reply. Returns whether it was delivered.
async fn send_reply(client: &mut TcpStream, reply: Reply, limit: Duration) -> bool {
    match send_all(client, &reply.to_bytes(), limit).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(code = reply.code(), error = %e, "Reply send failed");
            false
        }
    }
}
