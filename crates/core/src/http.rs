//! HTTP/1.1 data model and server.
//!
//! Requests and responses carry their headers as an ordered list of
//! `(name, value)` pairs: lookups are ASCII case-insensitive, but the
//! original casing is preserved on the wire.

#[cfg(feature = "server")]
mod parse;
#[cfg(feature = "server")]
mod server;
pub mod uri;

use bytes::Bytes;
use enumflags2::{BitFlags, bitflags};

use crate::body::{self, ByteStream};
use crate::{Error, HttpError, Result};

#[cfg(feature = "server")]
pub use server::{HttpHandler, HttpServer};

/// Request methods understood by the toolkit, WebDAV verbs included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `OPTIONS`
    Options,
    /// `HEAD`
    Head,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
    /// `PROPFIND`
    Propfind,
    /// `PROPPATCH`
    Proppatch,
    /// `MKCOL`
    Mkcol,
    /// `MOVE`
    Move,
    /// `COPY`
    Copy,
}

impl Method {
    /// The wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Propfind => "PROPFIND",
            Self::Proppatch => "PROPPATCH",
            Self::Mkcol => "MKCOL",
            Self::Move => "MOVE",
            Self::Copy => "COPY",
        }
    }

    /// Methods that never mutate server state; everything else makes a
    /// response cache invalidate itself.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Propfind)
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(method: &str) -> Result<Self> {
        Ok(match method {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "OPTIONS" => Self::Options,
            "HEAD" => Self::Head,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "PROPFIND" => Self::Propfind,
            "PROPPATCH" => Self::Proppatch,
            "MKCOL" => Self::Mkcol,
            "MOVE" => Self::Move,
            "COPY" => Self::Copy,
            _ => {
                return Err(HttpError::with_message(
                    HttpError::INVALID_METHOD,
                    format!("invalid method: {method}"),
                )
                .into());
            }
        })
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request annotations consumed by caching layers.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFlag {
    /// The request only reads server state, whatever its method says.
    Read,
    /// The request mutates server state; caches must invalidate.
    Write,
}

/// An ordered, case-preserving header list.
pub type Headers = Vec<(String, String)>;

/// Finds the first header named `name`, ASCII case-insensitively.
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Whether some header named `name` carries exactly `value`.
pub fn has_header(headers: &[(String, String)], name: &str, value: &str) -> bool {
    headers
        .iter()
        .any(|(key, candidate)| key.eq_ignore_ascii_case(name) && candidate == value)
}

/// A request body: nothing, an eagerly held buffer, or a lazy stream.
pub enum Body {
    /// No body.
    Empty,
    /// A fully materialized body; clients derive `Content-Length` from it.
    Full(Bytes),
    /// A streamed body.
    Stream(ByteStream),
}

impl Body {
    /// Whether the body is known to carry no bytes.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(data) => data.is_empty(),
            Self::Stream(_) => false,
        }
    }

    /// Replaces the body with [`Body::Empty`], returning the old value.
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Empty)
    }

    /// The body as a stream, or `None` when there is none.
    pub fn into_stream(self) -> Option<ByteStream> {
        match self {
            Self::Empty => None,
            Self::Full(data) => Some(body::full(data)),
            Self::Stream(stream) => Some(stream),
        }
    }

    /// Collects the body into one buffer.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Full(data) => Ok(data),
            Self::Stream(stream) => body::collect(stream).await,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(data) => write!(f, "Body::Full({} bytes)", data.len()),
            Self::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::Full(data)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Full(text.into())
    }
}

/// An HTTP request, on either side of the wire.
#[derive(Debug)]
pub struct Request {
    /// Request target (server side) or absolute URL (client side).
    pub url: String,
    /// Request method.
    pub method: Method,
    /// Ordered, case-preserving headers.
    pub headers: Headers,
    /// Request body.
    pub body: Body,
    /// Cache-facing annotations.
    pub flags: BitFlags<RequestFlag>,
}

impl Request {
    /// A `GET` request for `url` with no headers and no body.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: Headers::new(),
            body: Body::Empty,
            flags: BitFlags::empty(),
        }
    }

    /// Sets the method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the cache annotations.
    #[must_use]
    pub fn flags(mut self, flags: BitFlags<RequestFlag>) -> Self {
        self.flags = flags;
        self
    }
}

/// An HTTP response with a streamed body.
pub struct Response {
    /// Status code in `100..=599`.
    pub status: u16,
    /// Ordered, case-preserving headers.
    pub headers: Headers,
    /// Response body.
    pub body: ByteStream,
}

impl Response {
    /// An empty-bodied response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body::empty(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: ByteStream) -> Self {
        self.body = body;
        self
    }

    /// Sets the body from a buffer.
    #[must_use]
    pub fn body_full(self, data: impl Into<Bytes>) -> Self {
        self.body(body::full(data))
    }

    /// The first header named `name`, case-insensitively.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// The standard reason phrase for `status`, or `"Unknown"`.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
