//! Reconnect (retry) policy
//!
//! A `Call` interrupted by a connection error — the socket reset, the peer sent EOF
//! mid-response, the connection timed out — is either re-queued onto a fresh `Connection` or
//! failed outright, according to its [`ReconnectMode`]. The default is conservative: only
//! `GET`/`HEAD` calls are resent automatically, since resending a `POST` that may have already
//! been partially processed by the server risks a duplicate side effect.
//!
//! # Defaults
//!
//! [`ReconnectMode::default()`] is [`ReconnectMode::SendAgainIfIdempotent`]. Calls interrupted
//! before any byte of the request reached the peer are always safe to resend regardless of
//! method; this policy governs calls interrupted *after* the request was (at least partially)
//! sent.

use std::sync::Arc;

use http::Method;

/// Controls whether an interrupted `Call` is retried on a fresh `Connection`.
#[derive(Clone)]
pub enum ReconnectMode {
    /// Always re-send the call on a new connection.
    SendAgain,
    /// Never resend; the call terminates with a protocol error.
    RequestFails,
    /// Re-send only if the request method is idempotent (`GET`/`HEAD`). The default.
    SendAgainIfIdempotent,
    /// Ask a user-supplied predicate whether to resend, given the method and the current retry
    /// count for this call.
    Inquire(Arc<dyn Fn(&Method, u32) -> bool + Send + Sync>),
}

impl ReconnectMode {
    /// Create an [`ReconnectMode::Inquire`] policy from a closure.
    pub fn inquire<F>(f: F) -> Self
    where
        F: Fn(&Method, u32) -> bool + Send + Sync + 'static,
    {
        ReconnectMode::Inquire(Arc::new(f))
    }

    /// Decide whether a call using `method`, already retried `attempt` times, should be
    /// resent.
    pub(crate) fn should_resend(&self, method: &Method, attempt: u32) -> bool {
        match self {
            ReconnectMode::SendAgain => true,
            ReconnectMode::RequestFails => false,
            ReconnectMode::SendAgainIfIdempotent => is_idempotent(method),
            ReconnectMode::Inquire(f) => f(method, attempt),
        }
    }
}

impl Default for ReconnectMode {
    fn default() -> Self {
        ReconnectMode::SendAgainIfIdempotent
    }
}

impl std::fmt::Debug for ReconnectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectMode::SendAgain => f.write_str("SendAgain"),
            ReconnectMode::RequestFails => f.write_str("RequestFails"),
            ReconnectMode::SendAgainIfIdempotent => f.write_str("SendAgainIfIdempotent"),
            ReconnectMode::Inquire(_) => f.write_str("Inquire(..)"),
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resends_get_not_post() {
        let mode = ReconnectMode::default();
        assert!(mode.should_resend(&Method::GET, 0));
        assert!(mode.should_resend(&Method::HEAD, 0));
        assert!(!mode.should_resend(&Method::POST, 0));
        assert!(!mode.should_resend(&Method::PUT, 0));
    }

    #[test]
    fn send_again_always_resends() {
        let mode = ReconnectMode::SendAgain;
        assert!(mode.should_resend(&Method::POST, 3));
    }

    #[test]
    fn request_fails_never_resends() {
        let mode = ReconnectMode::RequestFails;
        assert!(!mode.should_resend(&Method::GET, 0));
    }

    #[test]
    fn inquire_consults_closure() {
        let mode = ReconnectMode::inquire(|_method, attempt| attempt < 2);
        assert!(mode.should_resend(&Method::POST, 0));
        assert!(!mode.should_resend(&Method::POST, 2));
    }
}
