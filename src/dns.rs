//! DNS resolution.
//!
//! Connecting a `Connection` requires turning a hostname into one or more `SocketAddr`s. The
//! default resolver spawns the system resolver via [`tokio::net::lookup_host`] on a blocking-safe
//! path; enabling the `hickory-dns` feature switches to [`hickory_resolver`] for async-native
//! resolution with its own cache and `/etc/resolv.conf` handling.
//!
//! Callers needing other behavior (split-horizon DNS, test fixtures, a service mesh's sidecar
//! resolver) implement [`Resolve`] and pass it to `Pipeline::with_resolver`.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
};

use crate::error::BoxError;

/// A hostname to resolve into one or more addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a [`Name`] from a string slice.
    #[inline]
    pub fn new<S: Into<Box<str>>>(host: S) -> Name {
        Name { host: host.into() }
    }

    /// Views the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// An iterator of resolved addresses.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// The future returned by [`Resolve::resolve`].
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, BoxError>> + Send>>;

/// Customizes how a [`Pipeline`](crate::pipeline::Pipeline) turns a hostname into addresses.
///
/// Implementations are consulted once per `Connection` dial in the `Resolving` state (§4.2); the
/// result's first address is used to connect, and a `Connection` does not fail over to later
/// addresses within the same attempt — a reconnection redials via `resolve` again.
pub trait Resolve: Send + Sync {
    /// Resolves `name` to one or more addresses. The port in each resolved address is ignored;
    /// the engine always connects to the port carried by the call's URI.
    fn resolve(&self, name: Name) -> Resolving;
}

/// Converts a concrete resolver into a shared `Arc<dyn Resolve>`, without requiring callers to
/// wrap it themselves.
pub trait IntoResolve {
    /// Converts `self` into an `Arc<dyn Resolve>`.
    fn into_resolve(self) -> Arc<dyn Resolve>;
}

impl IntoResolve for Arc<dyn Resolve> {
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for Arc<R>
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        self
    }
}

impl<R> IntoResolve for R
where
    R: Resolve + 'static,
{
    #[inline]
    fn into_resolve(self) -> Arc<dyn Resolve> {
        Arc::new(self)
    }
}

/// The default resolver: `tokio::net::lookup_host`, i.e. the system's `getaddrinfo`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as BoxError)?;
            let addrs: Vec<SocketAddr> = addrs.collect();
            if addrs.is_empty() {
                return Err(format!("no addresses found for {name}").into());
            }
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// A resolver that checks a fixed hostname-to-address override table before delegating to an
/// inner resolver. Useful in tests to pin a hostname to a loopback listener without touching
/// `/etc/hosts`.
pub struct OverrideResolver {
    inner: Arc<dyn Resolve>,
    overrides: HashMap<String, Vec<SocketAddr>>,
}

impl OverrideResolver {
    /// Wraps `inner`, consulting `overrides` first.
    pub fn new(inner: Arc<dyn Resolve>, overrides: HashMap<String, Vec<SocketAddr>>) -> Self {
        OverrideResolver { inner, overrides }
    }
}

impl fmt::Debug for OverrideResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideResolver")
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl Resolve for OverrideResolver {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs = addrs.clone();
            return Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) });
        }
        self.inner.resolve(name)
    }
}

#[cfg(feature = "hickory-dns")]
pub use hickory::HickoryResolver;

#[cfg(feature = "hickory-dns")]
mod hickory {
    use super::*;
    use hickory_resolver::TokioAsyncResolver;

    /// A [`Resolve`] backed by [`hickory_resolver`], bypassing the system resolver entirely.
    pub struct HickoryResolver {
        resolver: TokioAsyncResolver,
    }

    impl fmt::Debug for HickoryResolver {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("HickoryResolver").finish_non_exhaustive()
        }
    }

    impl HickoryResolver {
        /// Builds a resolver from the system's `/etc/resolv.conf` (or the platform equivalent).
        pub fn from_system_conf() -> Result<Self, BoxError> {
            let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
            Ok(HickoryResolver { resolver })
        }
    }

    impl Resolve for HickoryResolver {
        fn resolve(&self, name: Name) -> Resolving {
            let resolver = self.resolver.clone();
            Box::pin(async move {
                let lookup = resolver.lookup_ip(name.as_str()).await?;
                let addrs: Vec<SocketAddr> = lookup
                    .iter()
                    .map(|ip| SocketAddr::new(ip, 0))
                    .collect();
                if addrs.is_empty() {
                    return Err(format!("no addresses found for {name}").into());
                }
                Ok(Box::new(addrs.into_iter()) as Addrs)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubResolver(Vec<SocketAddr>);

    impl Resolve for StubResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.0.clone();
            Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
        }
    }

    #[tokio::test]
    async fn override_resolver_prefers_override() {
        let fallback_addr: SocketAddr = "127.0.0.9:1".parse().unwrap();
        let inner: Arc<dyn Resolve> = Arc::new(StubResolver(vec![fallback_addr]));
        let override_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("pinned.example".to_owned(), vec![override_addr]);
        let resolver = OverrideResolver::new(inner, overrides);

        let resolved: Vec<SocketAddr> = resolver
            .resolve(Name::from("pinned.example"))
            .await
            .unwrap()
            .collect();
        assert_eq!(resolved, vec![override_addr]);

        let passthrough: Vec<SocketAddr> = resolver
            .resolve(Name::from("other.example"))
            .await
            .unwrap()
            .collect();
        assert_eq!(passthrough, vec![fallback_addr]);
    }

    #[tokio::test]
    async fn into_resolve_wraps_concrete_type() {
        let addr: SocketAddr = "127.0.0.2:0".parse().unwrap();
        let dynamic: Arc<dyn Resolve> = StubResolver(vec![addr]).into_resolve();
        let resolved: Vec<SocketAddr> = dynamic.resolve(Name::from("stub.example")).await.unwrap().collect();
        assert_eq!(resolved, vec![addr]);
    }
}
