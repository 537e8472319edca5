//! The `Call`: the user-facing record for one HTTP request/response transaction (§3).
//!
//! A `Call` carries its request (method, URI, headers, body) and, once served, its response.
//! `condensed_status` is the coarse outcome a completion callback switches on; once it leaves
//! `Unserved` the `Call` is terminal and its response fields are readable.

use std::fmt;

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version, header::HeaderName};

use crate::{
    body::{Body, BodyStorage, ResponseBody},
    connection::ConnectionId,
    error::Error,
    redirect::{self, RedirectMode},
    retry::ReconnectMode,
};

/// Coarse classification of a `Call`'s outcome, for completion-callback consumers that don't
/// want to match on exact status codes.
#[derive(Debug, Clone)]
pub enum CondensedStatus {
    /// No response yet; the default until the call completes or fails.
    Unserved,
    /// The call failed below the HTTP layer (connect error, DNS failure, redirect loop, ...).
    ProtocolError(Error),
    /// A `2xx` response.
    Successful,
    /// A `3xx` response that was not (or could not be) followed.
    Redirection,
    /// A `4xx` response.
    ClientError,
    /// A `5xx` response.
    ServerError,
}

impl CondensedStatus {
    /// Classifies an HTTP status code into a [`CondensedStatus`] variant.
    pub(crate) fn from_status(status: StatusCode) -> CondensedStatus {
        match status.as_u16() {
            200..=299 => CondensedStatus::Successful,
            300..=399 => CondensedStatus::Redirection,
            400..=499 => CondensedStatus::ClientError,
            500..=599 => CondensedStatus::ServerError,
            _ => CondensedStatus::ProtocolError(Error::bad_message(format!("unexpected status {status}"))),
        }
    }

    /// True once the call has reached a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CondensedStatus::Unserved)
    }
}

/// A received response, readable once the owning `Call`'s status is terminal.
#[derive(Debug)]
pub struct CallResponse {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ResponseBody,
}

impl CallResponse {
    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response's reason phrase, as sent on the wire.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The negotiated HTTP version for the connection this response arrived on.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body, in whatever storage the call requested.
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }
}

/// Per-engine bookkeeping for a `Call`, invisible to callers. Reset whenever the call is
/// re-enqueued (redirect, retry).
#[derive(Debug, Default, Clone)]
pub(crate) struct CallState {
    pub(crate) assigned_connection: Option<ConnectionId>,
    pub(crate) retry_count: u32,
    pub(crate) redirect_count: u32,
    /// How many 401/407 challenges this call has answered, capping the auth retry loop
    /// independently of `retry_count` (§4.3).
    pub(crate) auth_attempts: u32,
    /// Identifies the completion callback registered for this call in `Pipeline::callbacks`, if
    /// it was added via `Pipeline::add_with_callback`.
    pub(crate) callback_id: Option<u64>,
}

/// One HTTP request/response transaction.
pub struct Call {
    method: Method,
    uri: Uri,
    base_headers: HeaderMap,
    effective_headers: HeaderMap,
    /// `Authorization`/`Proxy-Authorization` headers computed by the auth registry in response
    /// to a challenge; reapplied on top of `base_headers` every time `effective_headers` is
    /// rebuilt, since a plain resend would otherwise drop them. Cleared on redirect, since a
    /// cross-origin credential would be a protection-space violation.
    pending_auth_headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<Body>,
    body_storage: BodyStorage,
    reconnect_mode: ReconnectMode,
    redirect_mode: RedirectMode,
    proxy_enabled: bool,
    maximum_redirections: u32,
    status: CondensedStatus,
    response: Option<CallResponse>,
    pub(crate) state: CallState,
}

impl Call {
    /// Creates a new, unserved call.
    pub fn new(method: Method, uri: Uri) -> Self {
        Call {
            method,
            uri,
            base_headers: HeaderMap::new(),
            effective_headers: HeaderMap::new(),
            pending_auth_headers: Vec::new(),
            body: None,
            body_storage: BodyStorage::default(),
            reconnect_mode: ReconnectMode::default(),
            redirect_mode: RedirectMode::default(),
            proxy_enabled: true,
            maximum_redirections: 5,
            status: CondensedStatus::Unserved,
            response: None,
            state: CallState::default(),
        }
    }

    /// A `GET` call to `uri`.
    pub fn get(uri: Uri) -> Self {
        Call::new(Method::GET, uri)
    }

    /// A `POST` call to `uri` with the given body.
    pub fn post(uri: Uri, body: impl Into<Body>) -> Self {
        Call::new(Method::POST, uri).with_body(body)
    }

    /// Adds a header to the call's base header set. The base header is immutable during
    /// transfer: the engine enriches a private copy (`Host`, `Content-Length`, auth, ...) and
    /// never mutates this one.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.base_headers.append(name, value);
        self
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Chooses where the response body is written (default: buffered in memory).
    pub fn with_body_storage(mut self, storage: BodyStorage) -> Self {
        self.body_storage = storage;
        self
    }

    /// Overrides the reconnect (retry) policy for this call (default: `SendAgainIfIdempotent`).
    pub fn with_reconnect_mode(mut self, mode: ReconnectMode) -> Self {
        self.reconnect_mode = mode;
        self
    }

    /// Overrides the redirect policy for this call (default: `IdempotentOnly`).
    pub fn with_redirect_mode(mut self, mode: RedirectMode) -> Self {
        self.redirect_mode = mode;
        self
    }

    /// Caps the number of redirects this call will follow (default: 5).
    pub fn with_maximum_redirections(mut self, max: u32) -> Self {
        self.maximum_redirections = max;
        self
    }

    /// Disables routing this call through a configured proxy even if one is set on the
    /// `Pipeline` (default: `true`, i.e. the proxy is used when configured).
    pub fn with_proxy_enabled(mut self, enabled: bool) -> Self {
        self.proxy_enabled = enabled;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI. Updated in place as redirects are followed, so this always reflects the
    /// call's current effective target.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The user-supplied base headers (never mutated by the engine).
    pub fn base_headers(&self) -> &HeaderMap {
        &self.base_headers
    }

    /// Returns true if this call's method is idempotent (`GET`/`HEAD`), the same notion the
    /// default reconnect and redirect policies key on.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }

    /// This call's coarse outcome. `Unserved` until the call completes.
    pub fn status(&self) -> &CondensedStatus {
        &self.status
    }

    /// The response, once `status()` is terminal.
    pub fn response(&self) -> Option<&CallResponse> {
        self.response.as_ref()
    }

    pub(crate) fn reconnect_mode(&self) -> &ReconnectMode {
        &self.reconnect_mode
    }

    pub(crate) fn redirect_mode(&self) -> &RedirectMode {
        &self.redirect_mode
    }

    pub(crate) fn maximum_redirections(&self) -> u32 {
        self.maximum_redirections
    }

    pub(crate) fn proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    pub(crate) fn body_storage(&self) -> &BodyStorage {
        &self.body_storage
    }

    pub(crate) fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub(crate) fn take_resendable_body(&self) -> Option<Body> {
        self.body.as_ref().and_then(Body::try_clone)
    }

    pub(crate) fn effective_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.effective_headers
    }

    pub(crate) fn effective_headers(&self) -> &HeaderMap {
        &self.effective_headers
    }

    /// Rebuilds the effective header set from the base headers; called before each (re)send so
    /// stale `Host`/`Content-Length`/auth fields from a previous attempt don't linger. Any
    /// `Authorization`/`Proxy-Authorization` header computed in response to a challenge is
    /// reapplied on top.
    pub(crate) fn reset_effective_headers(&mut self) {
        self.effective_headers = self.base_headers.clone();
        for (name, value) in &self.pending_auth_headers {
            self.effective_headers.insert(name.clone(), value.clone());
        }
    }

    /// Records the header an auth session computed for this call's protection space, reapplied
    /// on every subsequent (re)send until cleared by a cross-origin redirect.
    pub(crate) fn set_pending_auth_header(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(slot) = self.pending_auth_headers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.pending_auth_headers.push((name, value));
        }
    }

    pub(crate) fn auth_attempts(&self) -> u32 {
        self.state.auth_attempts
    }

    pub(crate) fn increment_auth_attempts(&mut self) {
        self.state.auth_attempts += 1;
    }

    pub(crate) fn set_callback_id(&mut self, id: u64) {
        self.state.callback_id = Some(id);
    }

    pub(crate) fn callback_id(&self) -> Option<u64> {
        self.state.callback_id
    }

    /// Strips headers that must not cross an origin boundary (§4.7) from the base header set,
    /// called before routing a redirected call to its new origin.
    pub(crate) fn strip_sensitive_headers_for_redirect(&mut self, next: &Uri, previous: &Uri) {
        redirect::remove_sensitive_headers(&mut self.base_headers, next, previous);
    }

    /// Redirects this call to `next_uri`, incrementing the redirect counter. Fails with
    /// `too_many_redirections` if the counter would exceed `maximum_redirections`. Clears any
    /// pending auth header, since it was computed for the previous protection space.
    pub(crate) fn redirect_to(&mut self, next_uri: Uri) -> Result<(), Error> {
        if self.state.redirect_count >= self.maximum_redirections {
            return Err(Error::too_many_redirections().with_uri(next_uri));
        }
        self.state.redirect_count += 1;
        self.uri = next_uri;
        self.state.assigned_connection = None;
        self.pending_auth_headers.clear();
        Ok(())
    }

    pub(crate) fn mark_retry(&mut self) {
        self.state.retry_count += 1;
        self.state.assigned_connection = None;
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.state.retry_count
    }

    /// Completes this call with a response, classifying its condensed status.
    pub(crate) fn complete_with_response(&mut self, response: CallResponse) {
        self.status = CondensedStatus::from_status(response.status);
        self.response = Some(response);
    }

    /// Completes this call with a protocol-level failure (never reached the HTTP layer, or the
    /// engine gave up per the reconnect/redirect policy).
    pub(crate) fn complete_with_error(&mut self, err: Error) {
        self.status = CondensedStatus::ProtocolError(err);
    }

    /// Produces a fresh `Call` for the "same call" reload semantics (§3): a new call with
    /// status `Unserved`, sharing this call's method, URI, base headers, reconnect/redirect
    /// policy, and body (if resendable). A streaming body cannot be reloaded.
    pub fn reload(&self) -> Option<Call> {
        Some(Call {
            method: self.method.clone(),
            uri: self.uri.clone(),
            base_headers: self.base_headers.clone(),
            effective_headers: HeaderMap::new(),
            pending_auth_headers: Vec::new(),
            body: match &self.body {
                None => None,
                Some(b) => Some(b.try_clone()?),
            },
            body_storage: self.body_storage.clone(),
            reconnect_mode: self.reconnect_mode.clone(),
            redirect_mode: self.redirect_mode.clone(),
            proxy_enabled: self.proxy_enabled,
            maximum_redirections: self.maximum_redirections,
            status: CondensedStatus::Unserved,
            response: None,
            state: CallState::default(),
        })
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("status", &matches!(self.status, CondensedStatus::Unserved))
            .finish()
    }
}
