//! Error taxonomy for the pipeline engine.
//!
//! Every fallible operation in this crate returns [`Error`], an opaque wrapper around a
//! [`Kind`] plus an optional source error and an optional associated [`Uri`]. The taxonomy
//! mirrors the `fails with` list in the specification: connection-level failures are absorbed
//! by the engine and re-surface to the user as a per-`Call` [`Kind::HttpProtocol`] style error.

use std::{error::Error as StdError, fmt, io};

use http::Uri;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type used for dynamic error sources.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The error type returned by pipeline engine operations.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
    /// Whether `source` was `Some` before a `clone()` dropped it (`BoxError` isn't `Clone`) —
    /// lets classification that cares "did this have a cause" (e.g. `queue::classify_connection_failure`)
    /// survive the clone every `ConnectionFailed` outcome goes through.
    had_source: bool,
}

/// The taxonomy of failures a `Call` or a pipe operation can terminate with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// Operation attempted on a torn-down resource (closed `Pipe`, closed `Connection`).
    Closed,
    /// Server sent output the wire codec could not parse.
    BadMessage(String),
    /// Call aborted because an earlier call in the same connection's inflight queue failed and
    /// resend was not permitted for this call.
    NoReply,
    /// Redirect depth exceeded `maximum_redirections`.
    TooManyRedirections,
    /// DNS resolution failed for the given name.
    NameResolutionError(String),
    /// A `Location` header (or other post-redirect URI) could not be parsed.
    UrlSyntaxError(String),
    /// Non-blocking operation had no data/space available; retry later.
    WouldBlock,
    /// A signal interrupted the operation mid-I/O; retrying is valid.
    Interrupted,
    /// Write attempted on a `Pipe` after the writer signalled EOF.
    BrokenPipe,
    /// Connect, handshake, or protocol-level transport failure.
    Connect,
    /// An authentication key handler reported failure for this call.
    AuthFailed,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        let source = source.map(Into::into);
        Error {
            inner: Box::new(Inner {
                kind,
                had_source: source.is_some(),
                source,
                uri: None,
            }),
        }
    }

    pub(crate) fn closed() -> Error {
        Error::new(Kind::Closed, None::<Error>)
    }

    pub(crate) fn bad_message<S: Into<String>>(reason: S) -> Error {
        Error::new(Kind::BadMessage(reason.into()), None::<Error>)
    }

    pub(crate) fn no_reply() -> Error {
        Error::new(Kind::NoReply, None::<Error>)
    }

    pub(crate) fn too_many_redirections() -> Error {
        Error::new(Kind::TooManyRedirections, None::<Error>)
    }

    pub(crate) fn name_resolution_error<S: Into<String>>(name: S) -> Error {
        Error::new(Kind::NameResolutionError(name.into()), None::<Error>)
    }

    pub(crate) fn url_syntax_error<S: Into<String>>(url: S) -> Error {
        Error::new(Kind::UrlSyntaxError(url.into()), None::<Error>)
    }

    pub(crate) fn would_block() -> Error {
        Error::new(Kind::WouldBlock, None::<Error>)
    }

    pub(crate) fn interrupted() -> Error {
        Error::new(Kind::Interrupted, None::<Error>)
    }

    pub(crate) fn broken_pipe() -> Error {
        Error::new(Kind::BrokenPipe, None::<Error>)
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn auth_failed() -> Error {
        Error::new(Kind::AuthFailed, None::<Error>)
    }

    pub(crate) fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }
}

impl Error {
    /// The kind of failure this error represents.
    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// The URI associated with this error, if any.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Returns true if this is a transient I/O condition (`interrupted` or `would_block`).
    /// These never escape a `Connection`; they are retried internally.
    pub fn is_transient(&self) -> bool {
        matches!(self.inner.kind, Kind::WouldBlock | Kind::Interrupted)
    }

    /// Returns true if this error originated from DNS resolution.
    pub fn is_name_resolution(&self) -> bool {
        matches!(self.inner.kind, Kind::NameResolutionError(_))
    }

    /// Returns true if this error is a redirect-loop / depth overflow.
    pub fn is_too_many_redirections(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyRedirections)
    }

    /// Returns true if this error was constructed with an underlying cause, even after a
    /// `clone()` has dropped the actual `source()` chain (`BoxError` isn't `Clone`).
    pub(crate) fn had_source(&self) -> bool {
        self.inner.had_source
    }
}

impl Clone for Error {
    /// Clones the `kind` and `uri`; the original `source` chain is dropped since `BoxError`
    /// isn't `Clone`. Needed because a `Pipe`'s `State::Errored` is shared by both ends and each
    /// read/write after the first must hand back an independent `Error`. `had_source` survives
    /// the clone so callers that distinguish "had a cause" from "had none" don't silently see
    /// every cloned error as the latter.
    fn clone(&self) -> Self {
        Error {
            inner: Box::new(Inner {
                kind: self.inner.kind.clone(),
                source: None,
                uri: self.inner.uri.clone(),
                had_source: self.inner.had_source,
            }),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::would_block(),
            io::ErrorKind::Interrupted => Error::interrupted(),
            io::ErrorKind::BrokenPipe => Error::broken_pipe(),
            _ => Error::connect(e),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.inner.kind {
            Kind::Closed => f.write_str("operation on a closed resource")?,
            Kind::BadMessage(reason) => write!(f, "unparseable HTTP message: {reason}")?,
            Kind::NoReply => f.write_str("call aborted without a reply")?,
            Kind::TooManyRedirections => f.write_str("too many redirections")?,
            Kind::NameResolutionError(name) => write!(f, "name resolution failed for {name}")?,
            Kind::UrlSyntaxError(url) => write!(f, "invalid URL: {url}")?,
            Kind::WouldBlock => f.write_str("operation would block")?,
            Kind::Interrupted => f.write_str("operation interrupted")?,
            Kind::BrokenPipe => f.write_str("write after pipe EOF")?,
            Kind::Connect => f.write_str("connection error")?,
            Kind::AuthFailed => f.write_str("authentication failed")?,
        };
        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }
        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}
