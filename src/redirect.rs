//! Redirect handling
//!
//! By default a `Call` follows idempotent redirects (`GET`/`HEAD`) up to
//! [`Policy::default()`]'s limit of 5 hops, matching `maximum_redirections`. Use [`RedirectMode`]
//! to change which methods are followed, and a `Call`'s `maximum_redirections` option (plumbed
//! through [`Pipeline`](crate::pipeline::Pipeline)) to change the hop limit.

use std::{borrow::Cow, fmt, sync::Arc};

use http::{
    HeaderMap, Method, StatusCode, Uri,
    header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE},
};

/// Controls which request methods a `Call` is allowed to follow a redirect for.
#[derive(Clone)]
pub enum RedirectMode {
    /// Never follow redirects; the 30x response is delivered to the caller verbatim.
    Never,
    /// Follow redirects only for idempotent methods (`GET`/`HEAD`). The default.
    IdempotentOnly,
    /// Follow redirects for any method.
    Always,
    /// Ask a user-supplied predicate.
    Custom(Arc<dyn Fn(&Attempt) -> bool + Send + Sync>),
}

impl RedirectMode {
    /// Builds a [`RedirectMode::Custom`] from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Attempt) -> bool + Send + Sync + 'static,
    {
        RedirectMode::Custom(Arc::new(f))
    }

    pub(crate) fn allows(&self, attempt: &Attempt) -> bool {
        match self {
            RedirectMode::Never => false,
            RedirectMode::IdempotentOnly => {
                matches!(*attempt.method, Method::GET | Method::HEAD)
            }
            RedirectMode::Always => true,
            RedirectMode::Custom(f) => f(attempt),
        }
    }
}

impl Default for RedirectMode {
    fn default() -> Self {
        RedirectMode::IdempotentOnly
    }
}

impl fmt::Debug for RedirectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectMode::Never => f.write_str("Never"),
            RedirectMode::IdempotentOnly => f.write_str("IdempotentOnly"),
            RedirectMode::Always => f.write_str("Always"),
            RedirectMode::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Describes one hop of a redirect chain, passed to a [`RedirectMode::Custom`] predicate.
#[derive(Debug)]
pub struct Attempt<'a> {
    /// The status code of the redirect response.
    pub status: StatusCode,
    /// The method the request was sent with.
    pub method: Cow<'a, Method>,
    /// The headers of the redirect response.
    pub headers: Cow<'a, HeaderMap>,
    /// The URI the redirect points at.
    pub location: Cow<'a, Uri>,
    /// Every URI visited so far in this chain, oldest first.
    pub previous: Cow<'a, [Uri]>,
}

/// Returns true if a 30x status code is one of the ones this engine redirects on.
pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER | StatusCode::TEMPORARY_REDIRECT
    )
}

/// Strips headers that must not cross an origin boundary when following a redirect (RFC 7231
/// §6.4, plus common practice for cookies / proxy auth).
pub(crate) fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Uri, previous: &Uri) {
    let cross_origin = next.host() != previous.host()
        || next.port() != previous.port()
        || next.scheme() != previous.scheme();
    if cross_origin {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove(PROXY_AUTHORIZATION);
        headers.remove(WWW_AUTHENTICATE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(method: Method) -> Attempt<'static> {
        Attempt {
            status: StatusCode::FOUND,
            method: Cow::Owned(method),
            headers: Cow::Owned(HeaderMap::new()),
            location: Cow::Owned("http://x.y/z".parse().unwrap()),
            previous: Cow::Owned(Vec::new()),
        }
    }

    #[test]
    fn idempotent_only_allows_get() {
        let mode = RedirectMode::default();
        assert!(mode.allows(&attempt(Method::GET)));
        assert!(!mode.allows(&attempt(Method::POST)));
    }

    #[test]
    fn never_allows_nothing() {
        let mode = RedirectMode::Never;
        assert!(!mode.allows(&attempt(Method::GET)));
    }

    #[test]
    fn always_allows_post() {
        let mode = RedirectMode::Always;
        assert!(mode.allows(&attempt(Method::POST)));
    }

    #[test]
    fn custom_predicate_is_consulted() {
        let mode = RedirectMode::custom(|attempt| attempt.location.host() != Some("foo"));
        let mut foo_attempt = attempt(Method::GET);
        foo_attempt.location = Cow::Owned("http://foo/baz".parse().unwrap());
        assert!(!mode.allows(&foo_attempt));
    }

    #[test]
    fn strips_authorization_cross_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "let me in".parse().unwrap());
        let previous: Uri = "http://a.example/1".parse().unwrap();
        let next: Uri = "http://b.example/2".parse().unwrap();
        remove_sensitive_headers(&mut headers, &next, &previous);
        assert!(!headers.contains_key(AUTHORIZATION));
    }

    #[test]
    fn keeps_authorization_same_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "let me in".parse().unwrap());
        let previous: Uri = "http://a.example/1".parse().unwrap();
        let next: Uri = "http://a.example/2".parse().unwrap();
        remove_sensitive_headers(&mut headers, &next, &previous);
        assert!(headers.contains_key(AUTHORIZATION));
    }
}
