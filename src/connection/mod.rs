//! The per-connection state machine (§4.2).
//!
//! A [`Connection`] owns one TCP socket, a pipelining depth, and the negotiated protocol
//! version; [`Connection::run`] drives it through `Resolving → Connecting → Idle → Sending →
//! Awaiting → Reading → Closing/Closed`, with an `Error(kind)` sideband that always funnels back
//! into `Closing`. The states are real (`Phase`, observable via [`Connection::phase`]) even
//! though the control flow implementing them is ordinary `async`/`await` rather than a
//! hand-cranked poll loop — see the crate root docs for why that's the idiomatic realization of
//! the specification's externally-supplied reactor.

pub(crate) mod cache;

use std::{collections::VecDeque, fmt, time::Duration};

use bytes::{Buf, BytesMut};
use http::{
    HeaderValue, Method, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, DATE, EXPECT, HOST, TRANSFER_ENCODING, USER_AGENT},
};
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    body::BodySink,
    call::{Call, CallResponse},
    dns::{Name, Resolve},
    error::{Error, Kind, Result},
    wire::{self, BodyLength, ChunkedDecoder},
};

/// Default `User-Agent` sent on a request that doesn't already set one.
const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Where a `Connection` is in its lifecycle. Exposed read-only for diagnostics/logging; the
/// engine transitions it internally as `run` executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Unconnected,
    Resolving,
    Connecting,
    Idle,
    Sending,
    Awaiting,
    Reading,
    Closing,
    Closed,
    Error(ErrorPhaseKind),
}

/// The sideband error classification surfaced through `Phase::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhaseKind {
    Timeout,
    Reset,
    BadMessage,
}

/// Identifies one connection within its `Pipeline`, used to tag `Call::state.assigned_connection`
/// and in counters/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

/// Tunable limits a `Connection` is constructed with; mirrors the relevant subset of
/// `Pipeline`'s options (§4.1).
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Pipelining depth requested by `synchronization`; clamped to `[1, 8]`.
    pub pipeline_depth: usize,
    /// `Connection: close` is sent on every request when set (`inhibit_persistency`).
    pub inhibit_persistency: bool,
    /// Inactivity timeout between I/O transitions; past this the connection errors out.
    pub connection_timeout: Duration,
    /// How long `Sending` waits for a `100 Continue` before sending the body regardless.
    pub handshake_timeout: Duration,
    /// When set, requests are written in absolute-form (`GET http://host/path HTTP/1.1`)
    /// because the socket is actually connected to a forward proxy, not the origin (§4.8).
    pub proxied: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            pipeline_depth: 5,
            inhibit_persistency: false,
            connection_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(1),
            proxied: false,
        }
    }
}

impl ConnectionOptions {
    pub(crate) fn clamped_pipeline_depth(&self) -> usize {
        self.pipeline_depth.clamp(1, 8)
    }
}

/// The outcome `run` reports for one call once it leaves the connection, whether served or
/// abandoned because the connection died.
pub(crate) enum CallOutcome {
    /// The response was parsed and stored on the `Call`.
    Served,
    /// The connection failed before (or while) this call was being handled. The caller (the
    /// per-origin queue) decides whether to resend per the call's `ReconnectMode` and the
    /// `maximum_message_errors`/`maximum_connection_failures` counters (§4.4).
    ConnectionFailed(Error),
}

/// A dialed, negotiated connection to one `(host, port)`. Constructed by [`connect`]; driven by
/// [`Connection::run`].
pub struct Connection<S> {
    pub(crate) id: ConnectionId,
    #[allow(dead_code)]
    host: String,
    #[allow(dead_code)]
    port: u16,
    stream: S,
    phase: Phase,
    version_11: bool,
    pipelining_allowed: bool,
    saw_connection_close: bool,
    options: ConnectionOptions,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("version_11", &self.version_11)
            .field("pipelining_allowed", &self.pipelining_allowed)
            .field("saw_connection_close", &self.saw_connection_close)
            .finish_non_exhaustive()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The connection's current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// True if the connection has negotiated HTTP/1.1 and not seen `Connection: close`, i.e.
    /// further requests may be pipelined onto it.
    pub fn pipelining_allowed(&self) -> bool {
        self.pipelining_allowed && self.version_11 && !self.saw_connection_close
    }

    /// Runs this connection's send/await/read loop over `calls`, writing each in turn (up to the
    /// clamped pipelining depth) and reading responses in FIFO order (the pipelining invariant,
    /// P1). On success every call ends with `CallOutcome::Served` and a response stored on it.
    /// On a connection-level failure, every call not yet served gets
    /// `CallOutcome::ConnectionFailed` and the loop returns — the caller resends per reconnect
    /// policy (§4.4).
    pub(crate) async fn run(&mut self, calls: &mut [Call]) -> Vec<CallOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut inflight: VecDeque<usize> = VecDeque::new();
        let mut next_to_send = 0usize;
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        self.phase = Phase::Idle;

        while outcomes.len() < calls.len() {
            let depth = self.options.clamped_pipeline_depth();
            let can_pipeline = self.pipelining_allowed();
            let budget = if can_pipeline { depth } else { 1 };

            while next_to_send < calls.len() && inflight.len() < budget {
                self.phase = Phase::Sending;
                // Only `inhibit_persistency` asks the peer to close: reaching the end of this
                // batch says nothing about whether the queue has more work for this connection
                // once it's released back to the cache.
                let close_after = self.options.inhibit_persistency;
                match self.send_request(&mut calls[next_to_send], close_after).await {
                    Ok(()) => {
                        inflight.push_back(next_to_send);
                        next_to_send += 1;
                        self.phase = Phase::Awaiting;
                    }
                    Err(e) => return self.fail_remaining(calls.len(), outcomes, e),
                }
                if !can_pipeline {
                    break;
                }
            }

            let Some(idx) = inflight.pop_front() else {
                break;
            };

            self.phase = Phase::Reading;
            match self
                .read_and_store_response(&mut read_buf, &mut calls[idx])
                .await
            {
                Ok(keep_alive) => {
                    outcomes.push(CallOutcome::Served);
                    if !keep_alive {
                        self.saw_connection_close = true;
                        return self.fail_remaining(calls.len(), outcomes, Error::closed());
                    }
                }
                Err(e) => return self.fail_remaining(calls.len(), outcomes, e),
            }
        }

        self.phase = Phase::Idle;
        outcomes
    }

    fn fail_remaining(&mut self, total: usize, mut outcomes: Vec<CallOutcome>, err: Error) -> Vec<CallOutcome> {
        self.phase = Phase::Error(classify(&err));
        while outcomes.len() < total {
            outcomes.push(CallOutcome::ConnectionFailed(err.clone()));
        }
        self.phase = Phase::Closing;
        outcomes
    }

    async fn send_request(&mut self, call: &mut Call, close_after: bool) -> Result<()> {
        call.reset_effective_headers();
        {
            let headers = call.effective_headers_mut();
            if !headers.contains_key(HOST) {
                let host_value = match call.uri().port_u16() {
                    Some(port) => format!("{}:{}", call.uri().host().unwrap_or_default(), port),
                    None => call.uri().host().unwrap_or_default().to_owned(),
                };
                headers.insert(HOST, host_value.parse().map_err(|_| Error::bad_message("invalid host"))?);
            }
            if !headers.contains_key(DATE) {
                let date = httpdate::fmt_http_date(std::time::SystemTime::now());
                headers.insert(DATE, HeaderValue::from_str(&date).unwrap());
            }
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
            }
            if close_after {
                headers.insert(CONNECTION, "close".parse().unwrap());
            }
        }

        let body = call.take_resendable_body();
        let content_length = body.as_ref().and_then(|b| b.content_length());
        match content_length {
            Some(len) => {
                call.effective_headers_mut().insert(CONTENT_LENGTH, len.into());
            }
            None if body.is_some() => {
                call.effective_headers_mut()
                    .insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
            }
            None => {}
        }

        let wants_100_continue = call
            .effective_headers()
            .get(EXPECT)
            .map(|v| v.as_bytes() == b"100-continue")
            .unwrap_or(false);

        let target: Uri = if self.options.proxied {
            call.uri().clone()
        } else {
            call.uri()
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/")
                .parse()
                .unwrap_or_else(|_| call.uri().clone())
        };

        let mut buf = BytesMut::with_capacity(512);
        wire::write_request_head(&mut buf, call.method(), &target, call.effective_headers());
        self.write_all(&buf).await?;

        if wants_100_continue {
            // Best-effort: the specification's `Expect: 100-continue` handshake pauses for
            // `handshake_timeout` waiting on a `100 Continue` before sending the body
            // regardless; since we don't peek the stream without consuming bytes that might
            // belong to the final response, we simply honor the timeout as a pause.
            tokio::time::sleep(self.options.handshake_timeout).await;
        }

        if let Some(body) = body {
            if let Some(bytes) = body.into_bytes() {
                if content_length.is_some() {
                    if !bytes.is_empty() {
                        self.write_all(&bytes).await?;
                    }
                } else {
                    let mut chunk_buf = BytesMut::new();
                    wire::encode_chunk(&mut chunk_buf, &bytes);
                    wire::encode_last_chunk(&mut chunk_buf);
                    self.write_all(&chunk_buf).await?;
                }
            }
        }

        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match timeout(self.options.connection_timeout, self.stream.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::new(Kind::Connect, None::<Error>)),
        }
    }

    /// Reads `buf` until at least one more byte is available (or the peer closes), respecting
    /// `connection_timeout`. Returns the number of bytes appended; `0` means EOF.
    async fn fill(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = match timeout(self.options.connection_timeout, self.stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::new(Kind::Connect, None::<Error>)),
        };
        if n > 0 {
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    async fn read_headers(&mut self, buf: &mut BytesMut) -> Result<wire::ParsedResponse> {
        loop {
            if let Some(parsed) = wire::parse_response(buf)? {
                buf.advance(parsed.consumed);
                return Ok(parsed);
            }
            if self.fill(buf).await? == 0 {
                return Err(Error::bad_message("connection closed before response headers"));
            }
        }
    }

    /// Reads one full response (headers + body) in FIFO order, stores it on `call`, and returns
    /// whether the connection stays alive for a further request.
    async fn read_and_store_response(&mut self, buf: &mut BytesMut, call: &mut Call) -> Result<bool> {
        let method = call.method().clone();
        // Interim `1xx` responses (a solicited `100 Continue`, or any unsolicited informational
        // status a server sends per RFC 7231 §6.2.1) are not the final response to this request;
        // they carry no body and must be discarded so the next header block read stays aligned
        // with the pipelining FIFO (P1).
        let parsed = loop {
            let parsed = self.read_headers(buf).await?;
            if parsed.status.as_u16() >= 200 {
                break parsed;
            }
            debug!("discarding interim {} response on connection {:?}", parsed.status, self.id);
        };

        if parsed.version == Version::HTTP_11 {
            self.version_11 = true;
            self.pipelining_allowed = true;
        }
        let close = parsed
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let length = wire::body_length(&method, parsed.status, &parsed.headers)?;

        let mut sink = BodySink::open(call.body_storage())
            .await
            .map_err(|e| Error::new(Kind::Connect, Some(e)))?;

        match length {
            BodyLength::None => {}
            BodyLength::Fixed(mut remaining) => {
                while remaining > 0 {
                    if buf.is_empty() && self.fill(buf).await? == 0 {
                        return Err(Error::bad_message("connection closed mid-body"));
                    }
                    let chunk = wire::take_fixed(buf, &mut remaining);
                    sink.write(&chunk).await.map_err(|e| Error::new(Kind::Connect, Some(e)))?;
                }
            }
            BodyLength::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                loop {
                    let mut decoded = BytesMut::new();
                    decoder.decode(buf, &mut decoded)?;
                    if !decoded.is_empty() {
                        sink.write(&decoded).await.map_err(|e| Error::new(Kind::Connect, Some(e)))?;
                    }
                    if decoder.is_done() {
                        break;
                    }
                    if self.fill(buf).await? == 0 {
                        return Err(Error::bad_message("connection closed mid-chunked-body"));
                    }
                }
            }
            BodyLength::UntilClose => {
                loop {
                    if !buf.is_empty() {
                        let chunk = buf.split_to(buf.len());
                        sink.write(&chunk).await.map_err(|e| Error::new(Kind::Connect, Some(e)))?;
                    }
                    if self.fill(buf).await? == 0 {
                        break;
                    }
                }
            }
        }

        let response_body = sink.finish();
        call.complete_with_response(CallResponse {
            version: parsed.version,
            status: parsed.status,
            reason: parsed.reason,
            headers: parsed.headers,
            body: response_body,
        });

        Ok(!close && !matches!(length, BodyLength::UntilClose))
    }
}

fn classify(err: &Error) -> ErrorPhaseKind {
    match err.kind() {
        Kind::BadMessage(_) => ErrorPhaseKind::BadMessage,
        _ => ErrorPhaseKind::Reset,
    }
}

/// Resolves `host` and dials the first address that accepts a connection, respecting
/// `connection_timeout`. On success returns an `Idle`-phase [`Connection`].
pub(crate) async fn connect(
    id: ConnectionId,
    host: &str,
    port: u16,
    resolver: &dyn Resolve,
    options: ConnectionOptions,
) -> Result<Connection<TcpStream>> {
    let addrs = timeout(options.connection_timeout, resolver.resolve(Name::from(host)))
        .await
        .map_err(|_| Error::name_resolution_error(host))?
        .map_err(|e| Error::new(Kind::NameResolutionError(host.to_owned()), Some(e)))?;

    let mut last_err = None;
    for mut addr in addrs {
        addr.set_port(port);
        match timeout(options.connection_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("connected to {host}:{port} via {addr}");
                let _ = stream.set_nodelay(true);
                return Ok(Connection {
                    id,
                    host: host.to_owned(),
                    port,
                    stream,
                    phase: Phase::Idle,
                    version_11: false,
                    pipelining_allowed: false,
                    saw_connection_close: false,
                    options,
                });
            }
            Ok(Err(e)) => last_err = Some(Error::connect(e)),
            Err(_) => last_err = Some(Error::new(Kind::Connect, None::<Error>)),
        }
    }
    warn!("failed to connect to {host}:{port}");
    Err(last_err.unwrap_or_else(|| Error::name_resolution_error(host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;
    use http::Method;
    use tokio::io::duplex;

    #[test]
    fn pipeline_depth_clamps_to_eight() {
        let options = ConnectionOptions {
            pipeline_depth: 40,
            ..Default::default()
        };
        assert_eq!(options.clamped_pipeline_depth(), 8);
    }

    #[test]
    fn pipeline_depth_clamps_to_one() {
        let options = ConnectionOptions {
            pipeline_depth: 0,
            ..Default::default()
        };
        assert_eq!(options.clamped_pipeline_depth(), 1);
    }

    fn test_connection(stream: tokio::io::DuplexStream) -> Connection<tokio::io::DuplexStream> {
        Connection {
            id: ConnectionId(0),
            host: "example.test".into(),
            port: 80,
            stream,
            phase: Phase::Idle,
            version_11: false,
            pipelining_allowed: false,
            saw_connection_close: false,
            options: ConnectionOptions::default(),
        }
    }

    #[tokio::test]
    async fn single_request_reads_fixed_length_body() {
        let (client, mut server) = duplex(4096);
        let mut conn = test_connection(client);

        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET /x HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut calls = vec![Call::new(Method::GET, "http://example.test/x".parse().unwrap())];
        let outcomes = conn.run(&mut calls).await;
        server_task.await.unwrap();

        assert!(matches!(outcomes[0], CallOutcome::Served));
        let response = calls[0].response().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.body().as_bytes(), Some(b"hello".as_ref()));
    }

    #[tokio::test]
    async fn pipelined_requests_matched_fifo() {
        let (client, mut server) = duplex(8192);
        let mut conn = test_connection(client);

        let server_task = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 4096];
            let mut total = Vec::new();
            // read until we see both request lines
            loop {
                let n = server.read(&mut buf).await.unwrap();
                total.extend_from_slice(&buf[..n]);
                if total.windows(4).filter(|w| *w == b"\r\n\r\n").count() >= 2 {
                    break;
                }
            }
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\n1HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\n2")
                .await
                .unwrap();
        });

        let mut calls = vec![
            Call::new(Method::GET, "http://example.test/a".parse().unwrap()),
            Call::new(Method::GET, "http://example.test/b".parse().unwrap()),
        ];
        conn.version_11 = true;
        conn.pipelining_allowed = true;
        let outcomes = conn.run(&mut calls).await;
        server_task.await.unwrap();

        assert!(outcomes.iter().all(|o| matches!(o, CallOutcome::Served)));
        assert_eq!(calls[0].response().unwrap().body().as_bytes(), Some(b"1".as_ref()));
        assert_eq!(calls[1].response().unwrap().body().as_bytes(), Some(b"2".as_ref()));
    }
}
