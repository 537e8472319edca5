//! Request and response body storage.
//!
//! A request [`Body`] is either a reusable in-memory chunk or a one-shot byte stream; a `Call`
//! sourced from a [`Body::Streaming`] cannot be resent after it has started transmitting (the
//! retry policy in [`crate::retry`] checks this before resending).
//!
//! A response's [`BodyStorage`] chooses where the engine writes bytes as they arrive: `memory`
//! buffers them for `Call::response_body`, `file` streams them to a path obtained once at
//! response start, and `sink` hands them to a caller-supplied async writer.

use std::{
    fmt,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::io::AsyncWrite;

use crate::error::BoxError;

/// A request body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>),
}

impl Body {
    /// An empty body, used for methods like `GET` that carry none.
    pub fn empty() -> Body {
        Body::from(Bytes::new())
    }

    /// Wraps a byte stream as a one-shot request body. A `Call` built from a streaming body is
    /// not eligible for automatic resend: once the stream has been polled, its bytes cannot be
    /// replayed.
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Body {
            inner: Inner::Streaming(Box::pin(stream)),
        }
    }

    /// Returns the body's bytes if it was constructed from a reusable in-memory chunk.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(_) => None,
        }
    }

    /// Returns true if this body can be replayed on a fresh `Connection` after a retry.
    pub(crate) fn is_resendable(&self) -> bool {
        matches!(self.inner, Inner::Reusable(_))
    }

    /// The length of the body in bytes, if known in advance. `None` forces chunked encoding.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.len() as u64),
            Inner::Streaming(_) => None,
        }
    }

    /// Consumes the body into a single buffer when it is reusable, for the non-chunked fast
    /// path of `Connection::send`.
    pub(crate) fn into_bytes(self) -> Option<Bytes> {
        match self.inner {
            Inner::Reusable(bytes) => Some(bytes),
            Inner::Streaming(_) => None,
        }
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(Body::from(bytes.clone())),
            Inner::Streaming(_) => None,
        }
    }
}

impl Stream for Body {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Reusable(bytes) => {
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(std::mem::take(bytes))))
                }
            }
            Inner::Streaming(stream) => stream.as_mut().poll_next(cx),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body {
            inner: Inner::Reusable(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::from(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Reusable(bytes) => f.debug_tuple("Reusable").field(&bytes.len()).finish(),
            Inner::Streaming(_) => f.debug_tuple("Streaming").finish(),
        }
    }
}

/// Chooses where response bytes are written as they arrive off the wire.
#[derive(Clone)]
pub enum BodyStorage {
    /// Buffer the full response body in memory; retrievable from `Call::response_body`.
    Memory,
    /// Write the body to a file whose path is obtained by calling the closure once, at the
    /// start of the response.
    File(Arc<dyn Fn() -> PathBuf + Send + Sync>),
    /// Hand each chunk to a caller-supplied async writer, acquired once at the start of the
    /// response.
    Sink(Arc<dyn Fn() -> Box<dyn AsyncWrite + Unpin + Send> + Send + Sync>),
}

impl BodyStorage {
    /// Build a [`BodyStorage::File`] from a closure producing the destination path.
    pub fn file<F>(f: F) -> Self
    where
        F: Fn() -> PathBuf + Send + Sync + 'static,
    {
        BodyStorage::File(Arc::new(f))
    }

    /// Build a [`BodyStorage::Sink`] from a closure producing the destination writer.
    pub fn sink<F>(f: F) -> Self
    where
        F: Fn() -> Box<dyn AsyncWrite + Unpin + Send> + Send + Sync + 'static,
    {
        BodyStorage::Sink(Arc::new(f))
    }
}

impl Default for BodyStorage {
    fn default() -> Self {
        BodyStorage::Memory
    }
}

impl fmt::Debug for BodyStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyStorage::Memory => f.write_str("Memory"),
            BodyStorage::File(_) => f.write_str("File(..)"),
            BodyStorage::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

/// Where a response body lands once the response completes, mirroring the `BodyStorage` that
/// produced it.
#[derive(Debug)]
pub enum ResponseBody {
    /// The complete body, buffered.
    Memory(Bytes),
    /// The body was streamed to this path.
    File(PathBuf),
    /// The body was streamed to a caller-supplied sink; nothing further to retrieve here.
    Sink,
}

impl ResponseBody {
    /// The buffered bytes, if this response used [`BodyStorage::Memory`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ResponseBody::Memory(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }
}

/// Accumulates response bytes per the chosen [`BodyStorage`].
pub(crate) enum BodySink {
    Memory(BytesMut),
    File(tokio::fs::File, PathBuf),
    Writer(Box<dyn AsyncWrite + Unpin + Send>),
}

impl BodySink {
    pub(crate) async fn open(storage: &BodyStorage) -> Result<BodySink, BoxError> {
        match storage {
            BodyStorage::Memory => Ok(BodySink::Memory(BytesMut::new())),
            BodyStorage::File(make_path) => {
                let path = make_path();
                let file = tokio::fs::File::create(&path).await?;
                Ok(BodySink::File(file, path))
            }
            BodyStorage::Sink(make_writer) => Ok(BodySink::Writer(make_writer())),
        }
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<(), BoxError> {
        use tokio::io::AsyncWriteExt;
        match self {
            BodySink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            BodySink::File(file, _) => Ok(file.write_all(chunk).await?),
            BodySink::Writer(writer) => Ok(writer.write_all(chunk).await?),
        }
    }

    pub(crate) fn finish(self) -> ResponseBody {
        match self {
            BodySink::Memory(buf) => ResponseBody::Memory(buf.freeze()),
            BodySink::File(_, path) => ResponseBody::File(path),
            BodySink::Writer(_) => ResponseBody::Sink,
        }
    }
}
