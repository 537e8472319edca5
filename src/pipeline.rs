//! The top-level orchestrator (§4.1, §5): owns the shared connection cache, one [`OriginQueue`]
//! per connection target, authentication and proxy configuration, and the counters a caller
//! polls for liveness.
//!
//! `Pipeline` is driven by a single owner, the way this crate's teacher drives a client: enqueue
//! work with [`Pipeline::add`]/[`Pipeline::add_with_callback`], then call [`Pipeline::run`] to
//! drain it. `run` loops over every origin queue concurrently (`hyperium-hyper`'s
//! connector-per-origin fan-out, generalized to the whole set of origins a `Pipeline` has seen),
//! and after each round inspects completed calls for a redirect or auth challenge that routes
//! them into another round before finally handing them to their completion callback.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures_util::future::join_all;
use http::{StatusCode, Uri, header::LOCATION};
use log::{debug, warn};
use tokio::net::TcpStream;

use crate::{
    auth::AuthRegistry,
    call::Call,
    connection::cache::{CacheMode, ConnectionCache},
    dns::{IntoResolve, Resolve, SystemResolver},
    ext::UriExt,
    proxy::ProxyConfig,
    queue::{ConnectionStats, OriginQueue, QueueOptions},
    redirect::{self, Attempt},
};

/// A completion callback: invoked once, with the terminal `Call`, when it leaves the engine with
/// no further redirect/auth routing left to attempt.
pub type Callback = Box<dyn FnOnce(Call) + Send>;

/// Options governing every origin queue a `Pipeline` manages (§4.1), plus the cache eviction
/// mode and whether auth sessions are offered in advance of a challenge (§4.3).
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Per-origin connection limits and retry thresholds, applied identically to every origin.
    pub queue: QueueOptions,
    /// Restrictive (closed unless referenced) or aggressive (retained until `close_all`)
    /// eviction for the shared connection cache.
    pub cache_mode: CacheMode,
    /// Attach a known session's credentials to a call in its protection space before any
    /// challenge is received for it.
    pub enable_auth_in_advance: bool,
    /// Caps the number of 401/407 challenges a single call will answer before it is delivered
    /// to the caller as a client error, independent of `maximum_redirections`.
    pub maximum_auth_attempts: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            queue: QueueOptions::default(),
            cache_mode: CacheMode::Restrictive,
            enable_auth_in_advance: false,
            maximum_auth_attempts: 3,
        }
    }
}

/// A read-only snapshot of [`Pipeline`]'s monotonic connection counters (§4.1). At quiescence
/// (no pending or in-flight calls), `new_connections == failed_connections +
/// successful_connections` holds exactly as long as the connection cache never hands out a
/// reused connection; see `queue::ConnectionStats` for why reuse can make the two diverge in
/// practice, and `DESIGN.md` for the accepted reading of the invariant.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    /// Connections freshly dialed (cache miss).
    pub new_connections: u64,
    /// Connections that failed because a timeout elapsed.
    pub timed_out_connections: u64,
    /// Connections that failed for any other transport-level reason.
    pub crashed_connections: u64,
    /// Connections the peer closed before or during a response.
    pub server_eof_connections: u64,
    /// Connections that served their batch without error.
    pub successful_connections: u64,
    /// Connections that failed, for any reason, while serving their batch.
    pub failed_connections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    new_connections: AtomicU64,
    timed_out_connections: AtomicU64,
    crashed_connections: AtomicU64,
    server_eof_connections: AtomicU64,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
}

impl Counters {
    fn apply(&self, stats: ConnectionStats) {
        self.new_connections.fetch_add(stats.new, Ordering::Relaxed);
        self.timed_out_connections.fetch_add(stats.timed_out, Ordering::Relaxed);
        self.crashed_connections.fetch_add(stats.crashed, Ordering::Relaxed);
        self.server_eof_connections.fetch_add(stats.server_eof, Ordering::Relaxed);
        self.successful_connections.fetch_add(stats.successful, Ordering::Relaxed);
        self.failed_connections.fetch_add(stats.failed, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            new_connections: self.new_connections.load(Ordering::Relaxed),
            timed_out_connections: self.timed_out_connections.load(Ordering::Relaxed),
            crashed_connections: self.crashed_connections.load(Ordering::Relaxed),
            server_eof_connections: self.server_eof_connections.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }
}

/// One connection target an `OriginQueue` is keyed by: either a call's own origin, or a
/// configured proxy shared across every proxied origin.
type TargetKey = (String, u16);

/// The engine: a set of per-target queues, a shared connection cache, authentication and proxy
/// configuration, and the counters described in §4.1.
pub struct Pipeline {
    queues: HashMap<TargetKey, OriginQueue>,
    cache: Arc<ConnectionCache<TcpStream>>,
    resolver: Arc<dyn Resolve>,
    auth: AuthRegistry,
    proxy: Option<ProxyConfig>,
    options: PipelineOptions,
    counters: Counters,
    next_connection_id: AtomicU64,
    next_callback_id: AtomicU64,
    callbacks: HashMap<u64, Callback>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("cache", &self.cache)
            .field("auth", &self.auth)
            .field("proxy", &self.proxy)
            .field("options", &self.options)
            .field("counters", &self.counters)
            .field("pending_callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a `Pipeline` with the system DNS resolver, no configured proxy, and the default
    /// Basic/Digest auth registry.
    pub fn new(options: PipelineOptions) -> Self {
        Pipeline::with_resolver(options, SystemResolver)
    }

    /// Creates a `Pipeline` using `resolver` in place of the system resolver.
    pub fn with_resolver<R: IntoResolve>(options: PipelineOptions, resolver: R) -> Self {
        let cache = ConnectionCache::new(options.cache_mode);
        cache.register_pipeline();
        let auth = AuthRegistry::new(crate::auth::KeyRing::new()).enable_auth_in_advance(options.enable_auth_in_advance);
        Pipeline {
            queues: HashMap::new(),
            cache,
            resolver: resolver.into_resolve(),
            auth,
            proxy: None,
            options,
            counters: Counters::default(),
            next_connection_id: AtomicU64::new(0),
            next_callback_id: AtomicU64::new(0),
            callbacks: HashMap::new(),
        }
    }

    /// Registers an additional authentication scheme alongside the built-in Basic and Digest
    /// handlers. `AuthScheme` is not part of the public API (the engine closes over the two
    /// registered schemes); this exists for in-crate extension and tests.
    pub(crate) fn register_auth_handler(&mut self, scheme: Arc<dyn crate::auth::AuthScheme>) {
        self.auth.register(scheme);
    }

    /// Registers a credential directly with the auth key ring, bypassing any uplink handler.
    pub fn add_key(&mut self, key: crate::auth::Key) {
        self.auth.key_ring().add_key(key);
    }

    /// Configures a forward proxy every call (unless `Call::with_proxy_enabled(false)`) is
    /// routed through when its URI host is not excluded by `no_proxy`.
    pub fn configure_proxy(&mut self, proxy: ProxyConfig) {
        self.proxy = Some(proxy);
    }

    /// Removes any configured proxy; subsequent calls route directly to their origin.
    pub fn clear_proxy(&mut self) {
        self.proxy = None;
    }

    /// A snapshot of the monotonic connection counters (§4.1).
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Enqueues `call`. Its terminal outcome (after any redirect/auth routing completes) is
    /// dropped silently; use [`Pipeline::add_with_callback`] to observe it.
    pub fn add(&mut self, call: Call) {
        self.route(call);
    }

    /// Enqueues `call` with a callback invoked once it reaches a terminal outcome.
    pub fn add_with_callback<F>(&mut self, mut call: Call, callback: F)
    where
        F: FnOnce(Call) + Send + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        call.set_callback_id(id);
        self.callbacks.insert(id, Box::new(callback));
        self.route(call);
    }

    /// Aborts every pending and in-flight call with `no_reply`, invoking their callbacks, and
    /// returns idle connections to the cache or closes them per its mode (§4.1). The `Pipeline`
    /// is left empty and ready to accept new work.
    pub fn reset(&mut self) {
        for queue in self.queues.values_mut() {
            for call in queue.abort_all() {
                self.deliver(call);
            }
        }
        self.queues.clear();
        if self.options.cache_mode == CacheMode::Restrictive {
            self.cache.close_all();
        }
    }

    /// Drives every origin queue concurrently until all of them are empty, re-routing redirected
    /// and challenged calls back into (possibly different) queues between rounds. Returns once
    /// every call added before (or during) this call has reached a terminal outcome.
    pub async fn run(&mut self) {
        loop {
            let cache = &self.cache;
            let resolver = self.resolver.as_ref();
            let next_id = &self.next_connection_id;
            let futures: Vec<_> = self
                .queues
                .values_mut()
                .filter(|q| !q.is_empty())
                .map(|queue| queue.run(cache, resolver, next_id))
                .collect();
            if futures.is_empty() {
                break;
            }
            let results = join_all(futures).await;

            let mut next_round = Vec::new();
            for (completed, stats) in results {
                self.counters.apply(stats);
                for call in completed {
                    match self.advance(call) {
                        Ok(call) => next_round.push(call),
                        Err(call) => self.deliver(call),
                    }
                }
            }
            for call in next_round {
                self.route(call);
            }
        }
    }

    /// Computes the effective `(host, port)` a call's origin queue is keyed by, and whether the
    /// request must be framed in absolute-form because it is actually headed to a proxy (§4.8's
    /// routing rule: proxy if configured and the URI host is not excluded by `no_proxy`,
    /// otherwise the origin).
    fn routing_target(&self, call: &Call) -> (TargetKey, bool) {
        if call.proxy_enabled() {
            if let Some(proxy) = &self.proxy {
                if !proxy.is_excluded(call.uri()) {
                    return ((proxy.host().to_owned(), proxy.port()), true);
                }
            }
        }
        let host = call.uri().host().unwrap_or_default().to_owned();
        let port = call.uri().port_or_default();
        ((host, port), false)
    }

    /// Attaches auth-in-advance and proxy-authorization headers, then enqueues `call` onto its
    /// target origin queue, creating one if this is the first call routed there.
    fn route(&mut self, mut call: Call) {
        if let Some((name, value)) = self.auth.header_in_advance(call.uri(), call.method(), false) {
            call.set_pending_auth_header(name, value);
        }

        let (key, proxied) = self.routing_target(&call);

        if proxied {
            if let Some(proxy) = &self.proxy {
                if let Some(auth) = proxy.auth_header() {
                    call.set_pending_auth_header(http::header::PROXY_AUTHORIZATION, auth.clone());
                }
            }
        }

        let queue = self.queues.entry(key.clone()).or_insert_with(|| {
            let mut options = self.options.queue.clone();
            options.connection.proxied = proxied;
            OriginQueue::new(key.0, key.1, options)
        });
        queue.enqueue(call);
    }

    /// Inspects a completed call for a 401/407 challenge or a 3xx redirect it should follow.
    /// Returns `Ok(call)` (ready to route for another round) if it found one it could act on, or
    /// `Err(call)` if the call is terminal and should go straight to delivery.
    fn advance(&mut self, mut call: Call) -> Result<Call, Call> {
        let Some(status) = call.response().map(|r| r.status()) else {
            return Err(call);
        };

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            let is_proxy = status == StatusCode::PROXY_AUTHENTICATION_REQUIRED;
            if self.try_auth_retry(&mut call, is_proxy) {
                return Ok(call);
            }
            return Err(call);
        }

        if redirect::is_redirect_status(status) {
            return match self.try_redirect(&mut call) {
                Ok(true) => Ok(call),
                Ok(false) => Err(call),
                Err(()) => Err(call),
            };
        }

        Err(call)
    }

    fn try_auth_retry(&mut self, call: &mut Call, is_proxy: bool) -> bool {
        if call.auth_attempts() >= self.options.maximum_auth_attempts {
            return false;
        }
        let uri = call.uri().clone();
        let method = call.method().clone();
        let headers = call.response().expect("401/407 always carries a response").headers().clone();

        if call.auth_attempts() > 0 && !self.auth.invalidate(&uri, is_proxy, &headers) {
            debug!("auth session for {uri} rejected credentials again; giving up");
            return false;
        }

        match self.auth.respond_to_challenge(&uri, &method, is_proxy, &headers) {
            Ok(Some((name, value))) => {
                call.set_pending_auth_header(name, value);
                call.increment_auth_attempts();
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("failed to compute auth header for {uri}: {e}");
                false
            }
        }
    }

    fn try_redirect(&mut self, call: &mut Call) -> Result<bool, ()> {
        let response = call.response().expect("redirect status always carries a response");
        let status = response.status();
        let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            return Ok(false);
        };

        let previous_uri = call.uri().clone();
        let next_uri: Uri = match previous_uri.resolve(&location) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("redirect Location {location:?} from {previous_uri} could not be resolved: {e}");
                call.complete_with_error(e);
                return Err(());
            }
        };

        let attempt = Attempt {
            status,
            method: Cow::Borrowed(call.method()),
            headers: Cow::Borrowed(response.headers()),
            location: Cow::Borrowed(&next_uri),
            previous: Cow::Owned(Vec::new()),
        };
        if !call.redirect_mode().allows(&attempt) {
            return Ok(false);
        }

        match call.redirect_to(next_uri.clone()) {
            Ok(()) => {
                call.strip_sensitive_headers_for_redirect(&next_uri, &previous_uri);
                Ok(true)
            }
            Err(err) => {
                call.complete_with_error(err);
                Err(())
            }
        }
    }

    /// Hands a terminal call to its registered callback, if any.
    fn deliver(&mut self, call: Call) {
        match call.callback_id().and_then(|id| self.callbacks.remove(&id)) {
            Some(callback) => callback(call),
            None => drop(call),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cache.unregister_pipeline();
    }
}
