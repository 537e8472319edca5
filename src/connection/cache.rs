//! Connection cache (§4.5): a keyed pool of idle, already-negotiated connections, reused across
//! a pipeline's own calls and — when the same [`ConnectionCache`] is shared — across pipelines.
//!
//! Grounded on `hyperium-hyper`'s `client/pool.rs` (`Key`, `HashMap<Key, Vec<Conn>>`, hand back
//! on release rather than on drop).

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, trace};

use super::Connection;

/// How a connection reaches its origin. This crate implements only `Plain` (raw TCP); a TLS
/// provider layered on top — out of scope here, see `SPEC_FULL.md` §9 — would add variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    host: String,
    port: u16,
    transport: Transport,
}

/// Governs what happens to a connection handed back via [`ConnectionCache::release`] once it
/// becomes idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// A released connection is closed immediately unless some `Pipeline` still references this
    /// cache, tracked via [`ConnectionCache::register_pipeline`]/`unregister_pipeline`. The
    /// reference count is incremented by *every* `Pipeline` constructed against a shared cache,
    /// not just the first (Open Question decision — see `DESIGN.md`).
    Restrictive,
    /// Released connections are retained until [`ConnectionCache::close_all`] is called
    /// explicitly; lifecycle is entirely caller-owned.
    Aggressive,
}

/// A keyed pool of idle connections of stream type `S`.
pub struct ConnectionCache<S> {
    mode: CacheMode,
    idle: Mutex<HashMap<CacheKey, Vec<Connection<S>>>>,
    pipeline_refs: AtomicUsize,
}

impl<S> fmt::Debug for ConnectionCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_idle: usize = self.idle.lock().unwrap().values().map(Vec::len).sum();
        f.debug_struct("ConnectionCache")
            .field("mode", &self.mode)
            .field("idle_count", &total_idle)
            .field("pipeline_refs", &self.pipeline_refs.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S> ConnectionCache<S> {
    /// Creates an empty cache with the given eviction mode.
    pub fn new(mode: CacheMode) -> Arc<ConnectionCache<S>> {
        Arc::new(ConnectionCache {
            mode,
            idle: Mutex::new(HashMap::new()),
            pipeline_refs: AtomicUsize::new(0),
        })
    }

    /// Records that one more `Pipeline` now references this cache.
    pub(crate) fn register_pipeline(&self) {
        self.pipeline_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Records that a `Pipeline` that previously registered no longer references this cache.
    pub(crate) fn unregister_pipeline(&self) {
        self.pipeline_refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Removes and returns one idle connection to `(host, port)`, if any is cached. The caller
    /// still owns checking the returned connection's negotiated version/pipelining permission —
    /// the cache does not validate liveness beyond having been released cleanly.
    pub(crate) fn acquire(&self, host: &str, port: u16) -> Option<Connection<S>> {
        let key = cache_key(host, port);
        let mut idle = self.idle.lock().unwrap();
        let list = idle.get_mut(&key)?;
        let conn = list.pop();
        if list.is_empty() {
            idle.remove(&key);
        }
        if conn.is_some() {
            trace!("connection cache hit for {host}:{port}");
        }
        conn
    }

    /// Returns an idle connection to the cache, or drops (closes) it immediately per the cache's
    /// eviction mode.
    pub(crate) fn release(&self, host: &str, port: u16, conn: Connection<S>) {
        let keep = match self.mode {
            CacheMode::Aggressive => true,
            CacheMode::Restrictive => self.pipeline_refs.load(Ordering::SeqCst) > 0,
        };
        if !keep {
            debug!("restrictive cache has no live pipeline references; closing {host}:{port}");
            drop(conn);
            return;
        }
        let key = cache_key(host, port);
        self.idle.lock().unwrap().entry(key).or_default().push(conn);
    }

    /// Closes every idle connection, regardless of mode.
    pub fn close_all(&self) {
        self.idle.lock().unwrap().clear();
    }

    /// Number of idle connections currently held for `(host, port)`.
    pub(crate) fn idle_count(&self, host: &str, port: u16) -> usize {
        let key = cache_key(host, port);
        self.idle.lock().unwrap().get(&key).map(Vec::len).unwrap_or(0)
    }
}

fn cache_key(host: &str, port: u16) -> CacheKey {
    CacheKey {
        host: host.to_owned(),
        port,
        transport: Transport::Plain,
    }
}
