//! The per-origin queue (§3, §4.1): buffers calls addressed to one `(host, port)` and fans them
//! out across up to `number_of_parallel_connections` connections, each pipelined up to its
//! configured depth.

use std::{
    collections::VecDeque,
    error::Error as StdError,
    sync::atomic::{AtomicU64, Ordering},
};

use futures_util::future::join_all;
use tokio::net::TcpStream;

use crate::{
    call::Call,
    connection::{self, CallOutcome, ConnectionId, ConnectionOptions, Phase, cache::{CacheMode, ConnectionCache}},
    dns::Resolve,
    error::{Error, Kind},
};

/// Per-connection outcome tallies produced by one [`OriginQueue::run`], folded into the owning
/// `Pipeline`'s monotonic counters (§4.1). A connection contributes exactly one terminal
/// increment (`successful` xor `failed`, further split by failure cause) each time it is dialed
/// or reused to serve a batch; `new` only counts fresh dials. Because a cached connection can be
/// reused across many such terminal increments without a matching `new`, the `new = failed +
/// successful` invariant holds exactly only while the cache never reuses a connection — see
/// `DESIGN.md`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ConnectionStats {
    pub(crate) new: u64,
    pub(crate) timed_out: u64,
    pub(crate) crashed: u64,
    pub(crate) server_eof: u64,
    pub(crate) successful: u64,
    pub(crate) failed: u64,
}

impl ConnectionStats {
    fn add(&mut self, other: ConnectionStats) {
        self.new += other.new;
        self.timed_out += other.timed_out;
        self.crashed += other.crashed;
        self.server_eof += other.server_eof;
        self.successful += other.successful;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionFailureKind {
    TimedOut,
    Crashed,
    ServerEof,
}

/// Classifies a connection-level failure for the counters. `Kind::Connect` with no source is the
/// sentinel this crate's timeouts use throughout (`connection::Connection::write_all`/`fill`,
/// `connection::connect`'s dial timeout); a `BadMessage` whose reason mentions "closed" is an
/// early peer EOF rather than a genuine parse failure. Checked via `had_source` rather than
/// `err.source()` directly, since every `ConnectionFailed` outcome travels through at least one
/// `Error::clone()` (which drops the actual source chain) before reaching here.
fn classify_connection_failure(err: &Error) -> ConnectionFailureKind {
    match err.kind() {
        Kind::Connect if !err.had_source() => ConnectionFailureKind::TimedOut,
        Kind::BadMessage(reason) if reason.contains("closed") => ConnectionFailureKind::ServerEof,
        _ => ConnectionFailureKind::Crashed,
    }
}

fn bump_failure_kind(stats: &mut ConnectionStats, kind: ConnectionFailureKind) {
    match kind {
        ConnectionFailureKind::TimedOut => stats.timed_out = 1,
        ConnectionFailureKind::Crashed => stats.crashed = 1,
        ConnectionFailureKind::ServerEof => stats.server_eof = 1,
    }
}

/// Queue-level limits layered on top of a connection's own [`ConnectionOptions`] (§4.1).
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Per-connection send/await/read behavior (pipelining depth, timeouts, ...).
    pub connection: ConnectionOptions,
    /// How many connections may be open to this origin at once.
    pub number_of_parallel_connections: usize,
    /// How many fresh connections this queue may burn through before failing every pending call
    /// with a protocol error.
    pub maximum_connection_failures: u32,
    /// How many times a single call may be resent after a connection failure.
    pub maximum_message_errors: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            connection: ConnectionOptions::default(),
            number_of_parallel_connections: 2,
            maximum_connection_failures: 2,
            maximum_message_errors: 2,
        }
    }
}

/// Calls addressed to one `(host, port)`, along with this origin's share of the connection
/// fleet.
pub(crate) struct OriginQueue {
    host: String,
    port: u16,
    pending: VecDeque<Call>,
    options: QueueOptions,
    connection_failures: u32,
}

impl OriginQueue {
    pub(crate) fn new(host: String, port: u16, options: QueueOptions) -> Self {
        OriginQueue {
            host,
            port,
            pending: VecDeque::new(),
            options,
            connection_failures: 0,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn enqueue(&mut self, call: Call) {
        self.pending.push_back(call);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drives every pending call to completion (served, or a terminal protocol error), reusing
    /// or creating connections as needed. Returns the completed calls in the order they
    /// finished, not necessarily the order they were enqueued (§5, "Ordering guarantees").
    pub(crate) async fn run(
        &mut self,
        cache: &ConnectionCache<TcpStream>,
        resolver: &dyn Resolve,
        next_id: &AtomicU64,
    ) -> (Vec<Call>, ConnectionStats) {
        let mut completed = Vec::new();
        let mut stats = ConnectionStats::default();

        while !self.pending.is_empty() {
            if self.connection_failures >= self.options.maximum_connection_failures {
                while let Some(mut call) = self.pending.pop_front() {
                    call.complete_with_error(Error::new(Kind::Connect, None::<Error>));
                    completed.push(call);
                }
                break;
            }

            let slots = self.options.number_of_parallel_connections.max(1);
            let mut batches = Vec::with_capacity(slots);
            for _ in 0..slots {
                if self.pending.is_empty() {
                    break;
                }
                let depth = self.options.connection.clamped_pipeline_depth();
                let mut batch = Vec::with_capacity(depth);
                while batch.len() < depth {
                    match self.pending.pop_front() {
                        Some(call) => batch.push(call),
                        None => break,
                    }
                }
                batches.push(batch);
            }

            let host = self.host.as_str();
            let port = self.port;
            let maximum_message_errors = self.options.maximum_message_errors;
            let connection_options = self.options.connection.clone();

            let results = join_all(batches.into_iter().map(|batch| {
                run_connection_batch(host, port, connection_options.clone(), cache, resolver, next_id, maximum_message_errors, batch)
            }))
            .await;

            for result in results {
                completed.extend(result.completed);
                for call in result.retry {
                    self.pending.push_back(call);
                }
                if result.connection_failed {
                    self.connection_failures += 1;
                }
                stats.add(result.stats);
            }
        }

        (completed, stats)
    }

    /// Aborts every in-flight or pending call with `no_reply` and returns them, part of
    /// `Pipeline::reset` (§4.1). Connections already checked out are the caller's responsibility
    /// to return to the cache or close.
    pub(crate) fn abort_all(&mut self) -> Vec<Call> {
        let mut aborted = Vec::with_capacity(self.pending.len());
        while let Some(mut call) = self.pending.pop_front() {
            call.complete_with_error(Error::no_reply());
            aborted.push(call);
        }
        aborted
    }
}

struct BatchResult {
    completed: Vec<Call>,
    retry: Vec<Call>,
    connection_failed: bool,
    stats: ConnectionStats,
}

enum FailureOutcome {
    Retry(Call),
    Completed(Call),
}

fn classify_failure(mut call: Call, err: Error, maximum_message_errors: u32) -> FailureOutcome {
    let attempt = call.retry_count();
    let can_retry = attempt < maximum_message_errors && call.reconnect_mode().should_resend(call.method(), attempt);
    if can_retry {
        call.mark_retry();
        FailureOutcome::Retry(call)
    } else {
        call.complete_with_error(err);
        FailureOutcome::Completed(call)
    }
}

async fn run_connection_batch(
    host: &str,
    port: u16,
    options: ConnectionOptions,
    cache: &ConnectionCache<TcpStream>,
    resolver: &dyn Resolve,
    next_id: &AtomicU64,
    maximum_message_errors: u32,
    batch: Vec<Call>,
) -> BatchResult {
    let mut stats = ConnectionStats::default();

    let mut connection = match cache.acquire(host, port) {
        Some(conn) => conn,
        None => {
            stats.new = 1;
            let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
            match connection::connect(id, host, port, resolver, options).await {
                Ok(conn) => conn,
                Err(e) => {
                    stats.failed = 1;
                    bump_failure_kind(&mut stats, classify_connection_failure(&e));
                    let mut completed = Vec::new();
                    let mut retry = Vec::new();
                    for call in batch {
                        match classify_failure(call, e.clone(), maximum_message_errors) {
                            FailureOutcome::Retry(c) => retry.push(c),
                            FailureOutcome::Completed(c) => completed.push(c),
                        }
                    }
                    return BatchResult {
                        completed,
                        retry,
                        connection_failed: true,
                        stats,
                    };
                }
            }
        }
    };

    let mut batch = batch;
    let outcomes = connection.run(&mut batch).await;

    let mut completed = Vec::with_capacity(batch.len());
    let mut retry = Vec::new();
    let mut connection_failed = false;
    let mut failure_err: Option<Error> = None;

    for (call, outcome) in batch.into_iter().zip(outcomes) {
        match outcome {
            CallOutcome::Served => completed.push(call),
            CallOutcome::ConnectionFailed(err) => {
                connection_failed = true;
                if failure_err.is_none() {
                    failure_err = Some(err.clone());
                }
                match classify_failure(call, err, maximum_message_errors) {
                    FailureOutcome::Retry(c) => retry.push(c),
                    FailureOutcome::Completed(c) => completed.push(c),
                }
            }
        }
    }

    if connection_failed {
        stats.failed = 1;
        if let Some(err) = &failure_err {
            bump_failure_kind(&mut stats, classify_connection_failure(err));
        }
    } else {
        stats.successful = 1;
    }

    if !connection_failed && matches!(connection.phase(), Phase::Idle) {
        cache.release(host, port, connection);
    }

    BatchResult {
        completed,
        retry,
        connection_failed,
        stats,
    }
}

/// Convenience used by `Pipeline` to build a shared cache with the configured mode.
pub(crate) fn new_cache(mode: CacheMode) -> std::sync::Arc<ConnectionCache<TcpStream>> {
    ConnectionCache::new(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::Name;
    use tokio::net::TcpListener;

    struct LoopbackResolver(std::net::SocketAddr);

    impl Resolve for LoopbackResolver {
        fn resolve(&self, _name: Name) -> crate::dns::Resolving {
            let addr = self.0;
            Box::pin(async move { Ok(Box::new(std::iter::once(addr)) as crate::dns::Addrs) })
        }
    }

    async fn echo_server() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn drains_pending_calls_against_a_real_server() {
        let (listener, addr) = echo_server().await;
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET / HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let cache = ConnectionCache::new(CacheMode::Aggressive);
        let resolver = LoopbackResolver(addr);
        let next_id = AtomicU64::new(0);
        let mut queue = OriginQueue::new("localhost".into(), addr.port(), QueueOptions::default());
        queue.enqueue(Call::get(format!("http://localhost:{}/", addr.port()).parse().unwrap()));

        let (completed, stats) = queue.run(&cache, &resolver, &next_id).await;
        server.await.unwrap();

        assert_eq!(completed.len(), 1);
        assert_eq!(stats.new, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(completed[0].response().unwrap().body().as_bytes(), Some(b"ok".as_ref()));
    }

    #[tokio::test]
    async fn failed_connect_fails_all_pending_after_limit() {
        // Nothing is listening on this port; connect() should fail immediately.
        let doomed_addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cache = ConnectionCache::new(CacheMode::Aggressive);
        let resolver = LoopbackResolver(doomed_addr);
        let next_id = AtomicU64::new(0);
        let options = QueueOptions {
            connection: ConnectionOptions {
                connection_timeout: std::time::Duration::from_millis(200),
                ..Default::default()
            },
            maximum_connection_failures: 1,
            number_of_parallel_connections: 1,
            ..Default::default()
        };
        let mut queue = OriginQueue::new("localhost".into(), 1, options);
        queue.enqueue(Call::get("http://localhost:1/a".parse().unwrap()));
        queue.enqueue(Call::get("http://localhost:1/b".parse().unwrap()));

        let (completed, stats) = queue.run(&cache, &resolver, &next_id).await;
        assert_eq!(completed.len(), 2);
        for call in &completed {
            assert!(matches!(call.status(), crate::call::CondensedStatus::ProtocolError(_)));
        }
        assert!(stats.new >= 1);
        assert!(stats.failed >= 1);
    }

    #[test]
    fn abort_all_marks_no_reply() {
        let mut queue = OriginQueue::new("host".into(), 80, QueueOptions::default());
        queue.enqueue(Call::get("http://host/".parse().unwrap()));
        let aborted = queue.abort_all();
        assert_eq!(aborted.len(), 1);
        assert!(matches!(
            aborted[0].status(),
            crate::call::CondensedStatus::ProtocolError(e) if e.kind() == &crate::error::Kind::NoReply
        ));
    }
}
