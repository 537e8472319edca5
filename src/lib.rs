#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # pipewire-http
//!
//! An asynchronous HTTP/1.1 pipeline engine.
//!
//! Rather than a one-request-at-a-time client, this crate's [`Pipeline`] owns a cache of
//! connections per origin and pipelines up to several requests ahead of their responses on each
//! one (RFC 7230 §6.3.2), matching replies back to calls strictly in the order they were sent.
//! A `Pipeline` does not run on its own background task: the owning application drives it by
//! calling [`Pipeline::run`] from its own event loop.
//!
//! ```rust,no_run
//! use pipewire_http::{Call, Pipeline, PipelineOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut pipeline = Pipeline::new(PipelineOptions::default());
//!     pipeline.add_with_callback(Call::get("http://example.com/".parse().unwrap()), |call| {
//!         println!("{:?}", call.status());
//!     });
//!     pipeline.run().await;
//! }
//! ```
//!
//! ## Connection handling
//!
//! Each origin gets its own queue of pending calls, fanned out across a bounded number of
//! parallel connections (see [`QueueOptions`]). A connection that is idle when its queue empties
//! is handed back to a shared [`ConnectionCache`], whose eviction policy ([`CacheMode`]) governs
//! whether it is kept around for reuse by a later call to the same origin.
//!
//! ## Authentication
//!
//! Basic and Digest (RFC 7617, RFC 7616) are registered by default; [`Pipeline::add_key`]
//! supplies credentials, and a 401/407 response is answered automatically up to
//! [`PipelineOptions::maximum_auth_attempts`] times per call.
//!
//! ## Redirects
//!
//! [`RedirectMode`] governs whether, and how many times, a 3xx response with a `Location` header
//! is followed; headers that must not cross an origin boundary are stripped automatically (see
//! [`Attempt`] for custom policies).
//!
//! ## Feature flags
//!
//! - **hickory-dns**: resolve hostnames with the `hickory-resolver` crate instead of the
//!   system resolver.

pub use http::{Method, StatusCode, Uri, Version, header};

mod auth;
mod body;
mod call;
mod connection;
mod dns;
mod error;
mod ext;
mod pipe;
mod pipeline;
mod proxy;
mod queue;
mod redirect;
mod retry;
mod wire;

pub use self::auth::{Key, KeyHandler, KeyRing};
pub use self::body::Body;
pub use self::call::{Call, CallResponse, CondensedStatus};
pub use self::connection::{
    ConnectionId, ConnectionOptions,
    cache::{CacheMode, ConnectionCache},
};
pub use self::dns::{Addrs, IntoResolve, Name, Resolve, Resolving, SystemResolver};
pub use self::error::{BoxError, Error, Kind, Result};
pub use self::pipe::{PipeDescriptor, PipeReader, PipeWriter, channel};
pub use self::pipeline::{Callback, CounterSnapshot, Pipeline, PipelineOptions};
pub use self::proxy::ProxyConfig;
pub use self::queue::QueueOptions;
pub use self::redirect::{Attempt, RedirectMode};
pub use self::retry::ReconnectMode;

#[cfg(feature = "hickory-dns")]
pub use self::dns::HickoryResolver;

fn _assert_impls() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<Pipeline>();
    assert_send::<Call>();
    assert_send::<Error>();
    assert_sync::<Error>();
}
