//! Core of the Strand networking toolkit.
//!
//! Strand exposes a small, cancellable, backpressured I/O substrate and two
//! framing protocol engines on top of it:
//!
//! - [`sync`] and [`runtime`]: cooperative-task utilities: promises,
//!   single-flight shared promises, stop tokens, timers and a blocking-pool
//!   escape hatch.
//! - [`conn`]: a TCP connection server that hands every connection to a
//!   handler as a pull-based byte source plus a push-based chunk sink, with
//!   flow control and graceful shutdown.
//! - [`http`]: an HTTP/1.1 parser and serializer layered on [`conn`], with
//!   chunked transfer, `Expect: 100-continue`, keep-alive and streaming
//!   bodies in both directions.
//! - [`client`]: a streaming HTTP client multiplexing many in-flight
//!   transfers over one pooled backend.
//!
//! Everything is driven by the ambient tokio runtime; cancellation flows
//! through [`CancellationToken`](tokio_util::sync::CancellationToken)s and
//! surfaces as [`Error::Cancelled`] at the next suspension point.

pub mod body;
#[cfg(feature = "server")]
pub mod conn;
mod error;
pub mod http;
pub mod runtime;
pub mod sync;

#[cfg(feature = "client")]
pub mod client;

pub use error::{Error, HttpError, Result};

/// A prelude of the types nearly every user of the toolkit touches.
pub mod prelude {
    #[cfg(feature = "client")]
    pub use crate::client::{Client, HttpClient};
    pub use crate::body::ByteStream;
    #[cfg(feature = "server")]
    pub use crate::conn::ServerConfig;
    #[cfg(feature = "server")]
    pub use crate::http::HttpServer;
    pub use crate::http::{Method, Request, Response};
    pub use crate::sync::CancellationToken;
    pub use crate::{Error, HttpError, Result};
}
