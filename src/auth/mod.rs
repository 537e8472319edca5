//! Authentication orchestration (§4.3): challenge parsing, protection spaces, the key ring, and
//! the per-scheme session objects that compute `Authorization`/`Proxy-Authorization` headers.
//!
//! [`basic`] and [`digest`] implement the two registered schemes. [`AuthRegistry`] is the
//! `Pipeline`-owned front door: it turns a 401/407 response into a session, remembers that
//! session keyed by its protection space, and (when `enable_auth_in_advance` is set) attaches
//! credentials to later calls whose URI falls within a known protection space without waiting
//! for a fresh challenge.

pub mod basic;
pub mod digest;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use http::{HeaderMap, HeaderValue, Method, Uri, header::{AUTHORIZATION, HeaderName}};

use crate::error::{Error, Result};

/// A credential: username, password, the realm it was issued for (if known), and the set of
/// URIs describing its protection space (RFC 2617 `domain`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub domain: Vec<Uri>,
}

impl Key {
    /// Creates a key valid for any realm/domain challenged for its host.
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Key {
            username: username.into(),
            password: password.into(),
            realm: None,
            domain: Vec::new(),
        }
    }

    /// Restricts this key to a specific realm.
    pub fn with_realm<R: Into<String>>(mut self, realm: R) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Restricts this key to the given protection-space domain URIs.
    pub fn with_domain(mut self, domain: Vec<Uri>) -> Self {
        self.domain = domain;
        self
    }
}

/// Resolves credentials on demand. The engine calls `inquire_key` the first time a protection
/// space is challenged; a cache miss falls through to an optional uplink handler (e.g. asking
/// the user interactively), matching the `key handler interface` (§6).
pub trait KeyHandler: Send + Sync {
    /// Looks up a key for a protection space described by `domain` (absolute URIs), the set of
    /// `realms` offered across all challenges for this request, and the lowercase `scheme` name.
    fn inquire_key(&self, domain: &[Uri], realms: &[String], scheme: &str) -> Option<Key>;

    /// Called when a previously returned key is rejected again after a fresh challenge; the
    /// default does nothing.
    fn invalidate_key(&self, _key: &Key) {}
}

/// Caches resolved [`Key`]s and delegates misses to an optional uplink [`KeyHandler`].
pub struct KeyRing {
    cached: Mutex<Vec<Key>>,
    uplink: Option<Arc<dyn KeyHandler>>,
}

impl KeyRing {
    /// Creates an empty key ring with no uplink handler.
    pub fn new() -> Self {
        KeyRing {
            cached: Mutex::new(Vec::new()),
            uplink: None,
        }
    }

    /// Creates a key ring that delegates to `uplink` on a cache miss.
    pub fn with_uplink(uplink: Arc<dyn KeyHandler>) -> Self {
        KeyRing {
            cached: Mutex::new(Vec::new()),
            uplink: Some(uplink),
        }
    }

    /// Registers a key directly, bypassing the uplink handler entirely.
    pub fn add_key(&self, key: Key) {
        self.cached.lock().unwrap().push(key);
    }

    pub(crate) fn inquire(&self, domain: &[Uri], realms: &[String], scheme: &str) -> Option<Key> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(key) = cached.iter().find(|k| key_matches(k, realms)) {
                return Some(key.clone());
            }
        }
        let key = self.uplink.as_ref()?.inquire_key(domain, realms, scheme)?;
        self.cached.lock().unwrap().push(key.clone());
        Some(key)
    }

    pub(crate) fn invalidate(&self, key: &Key) {
        self.cached.lock().unwrap().retain(|k| k != key);
        if let Some(uplink) = &self.uplink {
            uplink.invalidate_key(key);
        }
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        KeyRing::new()
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("cached", &self.cached.lock().unwrap().len())
            .field("has_uplink", &self.uplink.is_some())
            .finish()
    }
}

fn key_matches(key: &Key, realms: &[String]) -> bool {
    match &key.realm {
        Some(realm) => realms.iter().any(|r| r == realm),
        None => true,
    }
}

/// Identifies a protection space: the `(host, port, scheme, realm)` tuple calls sharing a
/// session are matched on (§ glossary, "Protection space").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ProtectionSpaceId {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) scheme: String,
    pub(crate) realm: String,
}

/// One `WWW-Authenticate`/`Proxy-Authenticate` challenge, parsed into scheme + parameters.
#[derive(Debug, Clone)]
pub(crate) struct Challenge {
    pub(crate) scheme: String,
    pub(crate) params: HashMap<String, String>,
}

/// Parses every challenge present in a (possibly multi-valued) auth header into a list of
/// [`Challenge`]s. Servers may offer more than one scheme; each gets its own line or the same
/// line comma-joined outside quoted strings — we only need the common single-challenge-per-line
/// case plus the quoted-parameter grammar of RFC 2617 §1.2.
pub(crate) fn parse_challenges(headers: &HeaderMap, header_name: HeaderName) -> Vec<Challenge> {
    headers
        .get_all(header_name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(parse_one_challenge)
        .collect()
}

fn parse_one_challenge(raw: &str) -> Option<Challenge> {
    let raw = raw.trim();
    let (scheme, rest) = raw.split_once(char::is_whitespace)?;
    let scheme = scheme.to_ascii_lowercase();
    let mut params = HashMap::new();

    for part in split_params(rest.trim()) {
        if let Some((name, value)) = part.split_once('=') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"').to_owned();
            params.insert(name, value);
        }
    }

    Some(Challenge { scheme, params })
}

/// Splits challenge parameters on commas that are not inside a quoted string.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// A live authentication session for one protection space: holds whatever per-scheme state is
/// needed (Digest nonce/nc/cnonce; Basic needs none beyond the key) and computes the header
/// value for each call.
pub(crate) trait Session: Send + Sync {
    /// Computes the `Authorization` (or `Proxy-Authorization`) header value for a request.
    fn authorization(&mut self, method: &Method, uri: &Uri) -> Result<HeaderValue>;

    /// Called when this session's credentials are rejected again by a fresh challenge.
    /// Returns `true` if the rejection is recoverable (e.g. a Digest `stale=true` nonce refresh)
    /// and the call should retry with a new header; `false` means the credentials themselves
    /// are wrong and the call should terminate as a client error.
    fn invalidate(&mut self, challenge: &Challenge) -> bool;

    /// The domain URIs (RFC 2617 `domain`) this session's credentials apply to, used for
    /// prefix-matching auth-in-advance.
    fn domain(&self) -> &[Uri];
}

/// A registered authentication scheme: knows how to recognize its own challenges and build a
/// [`Session`] from one plus a resolved [`Key`].
pub(crate) trait AuthScheme: Send + Sync {
    /// Lowercase scheme token, e.g. `"digest"`.
    fn name(&self) -> &'static str;

    /// Relative preference when multiple schemes are offered; higher wins (Digest > Basic).
    fn strength(&self) -> u8;

    /// Builds a session from a parsed challenge and a resolved credential.
    fn create_session(&self, challenge: &Challenge, key: Key) -> Box<dyn Session>;
}

/// Owns the registered [`AuthScheme`]s, the [`KeyRing`], and the live [`Session`]s keyed by
/// protection space. One instance per `Pipeline`.
pub struct AuthRegistry {
    schemes: Vec<Arc<dyn AuthScheme>>,
    sessions: Mutex<HashMap<ProtectionSpaceId, Arc<Mutex<Box<dyn Session>>>>>,
    key_ring: KeyRing,
    enable_auth_in_advance: bool,
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("schemes", &self.schemes.len())
            .field("sessions", &self.sessions.lock().unwrap().len())
            .field("key_ring", &self.key_ring)
            .field("enable_auth_in_advance", &self.enable_auth_in_advance)
            .finish()
    }
}

impl AuthRegistry {
    /// Creates a registry with the default Basic and Digest handlers.
    pub fn new(key_ring: KeyRing) -> Self {
        AuthRegistry {
            schemes: vec![Arc::new(basic::BasicScheme), Arc::new(digest::DigestScheme)],
            sessions: Mutex::new(HashMap::new()),
            key_ring,
            enable_auth_in_advance: false,
        }
    }

    /// Enables attaching a known session's credentials to calls in its protection space before
    /// any challenge is received for them.
    pub fn enable_auth_in_advance(mut self, enable: bool) -> Self {
        self.enable_auth_in_advance = enable;
        self
    }

    /// Registers an additional [`AuthScheme`] (e.g. a custom or experimental scheme).
    pub fn register(&mut self, scheme: Arc<dyn AuthScheme>) {
        self.schemes.push(scheme);
    }

    /// The key ring backing this registry, for registering credentials directly.
    pub(crate) fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    /// Handles a 401/407 response: parses the challenge header, selects the strongest offered
    /// scheme this registry recognizes, resolves a key, creates (or reuses) a session, and
    /// returns the header value to attach on resend. Returns `Ok(None)` if no registered scheme
    /// was offered, or the key handler could not resolve credentials.
    pub(crate) fn respond_to_challenge(
        &self,
        uri: &Uri,
        method: &Method,
        is_proxy: bool,
        response_headers: &HeaderMap,
    ) -> Result<Option<(HeaderName, HeaderValue)>> {
        let header_name = if is_proxy {
            http::header::PROXY_AUTHENTICATE
        } else {
            http::header::WWW_AUTHENTICATE
        };
        let challenges = parse_challenges(response_headers, header_name);
        if challenges.is_empty() {
            return Ok(None);
        }

        let Some((scheme_impl, challenge)) = self.strongest_offered(&challenges) else {
            return Ok(None);
        };

        let realms: Vec<String> = challenges
            .iter()
            .filter_map(|c| c.params.get("realm").cloned())
            .collect();
        let realm = challenge.params.get("realm").cloned().unwrap_or_default();
        let host = uri.host().unwrap_or_default().to_owned();
        let port = uri_port(uri);

        let space = ProtectionSpaceId {
            host: host.clone(),
            port,
            scheme: scheme_impl.name().to_owned(),
            realm: realm.clone(),
        };

        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(&space) {
                existing.clone()
            } else {
                let domain_uris = vec![uri.clone()];
                let Some(key) = self.key_ring.inquire(&domain_uris, &realms, scheme_impl.name()) else {
                    return Ok(None);
                };
                let session = Arc::new(Mutex::new(scheme_impl.create_session(challenge, key)));
                sessions.insert(space.clone(), session.clone());
                session
            }
        };

        let header_value = session.lock().unwrap().authorization(method, uri)?;
        let header_name = if is_proxy {
            http::header::PROXY_AUTHORIZATION
        } else {
            AUTHORIZATION
        };
        Ok(Some((header_name, header_value)))
    }

    /// Looks up a session whose protection space contains `uri` and returns its header value,
    /// without requiring a fresh challenge. Used for auth-in-advance.
    pub(crate) fn header_in_advance(&self, uri: &Uri, method: &Method, is_proxy: bool) -> Option<(HeaderName, HeaderValue)> {
        if !self.enable_auth_in_advance {
            return None;
        }
        let host = uri.host()?;
        let port = uri_port(uri);
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.iter().find_map(|(space, session)| {
            if space.host == host && space.port == port {
                Some(session)
            } else {
                None
            }
        })?;
        let mut session = session.lock().unwrap();
        let within_domain = session.domain().iter().any(|d| uri_is_prefixed_by(uri, d));
        if !within_domain {
            return None;
        }
        let header_value = session.authorization(method, uri).ok()?;
        let header_name = if is_proxy {
            http::header::PROXY_AUTHORIZATION
        } else {
            AUTHORIZATION
        };
        Some((header_name, header_value))
    }

    /// Handles a repeat 401/407 for a call already carrying a session's credentials: asks the
    /// session to classify the rejection. Returns `true` (retry with a refreshed header) or
    /// `false` (the credentials are wrong; terminate as a client error).
    pub(crate) fn invalidate(
        &self,
        uri: &Uri,
        is_proxy: bool,
        response_headers: &HeaderMap,
    ) -> bool {
        let header_name = if is_proxy {
            http::header::PROXY_AUTHENTICATE
        } else {
            http::header::WWW_AUTHENTICATE
        };
        let challenges = parse_challenges(response_headers, header_name);
        let Some(challenge) = challenges.first() else {
            return false;
        };
        let Some(host) = uri.host() else { return false };
        let port = uri_port(uri);
        let realm = challenge.params.get("realm").cloned().unwrap_or_default();
        let space = ProtectionSpaceId {
            host: host.to_owned(),
            port,
            scheme: challenge.scheme.clone(),
            realm,
        };
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&space) {
            Some(session) => session.lock().unwrap().invalidate(challenge),
            None => false,
        }
    }

    fn strongest_offered<'c>(&self, challenges: &'c [Challenge]) -> Option<(&Arc<dyn AuthScheme>, &'c Challenge)> {
        challenges
            .iter()
            .filter_map(|c| {
                self.schemes
                    .iter()
                    .find(|s| s.name() == c.scheme)
                    .map(|s| (s, c))
            })
            .max_by_key(|(s, _)| s.strength())
    }
}

fn uri_port(uri: &Uri) -> u16 {
    uri.port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 })
}

fn uri_is_prefixed_by(uri: &Uri, domain: &Uri) -> bool {
    uri.host() == domain.host() && uri.port() == domain.port() && uri.path().starts_with(domain.path())
}

/// Error helper for scheme implementations whose credentials cannot be encoded.
pub(crate) fn invalid_credentials() -> Error {
    Error::auth_failed()
}
