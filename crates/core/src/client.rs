//! Streaming HTTP client.
//!
//! [`Client`] multiplexes any number of in-flight transfers over one pooled
//! hyper backend. [`fetch`](HttpClient::fetch) resolves as soon as the
//! response head arrives; the body is a lazy [`ByteStream`] that only pulls
//! bytes off the transport when the consumer asks for them, which is the
//! client's receive-side flow control. HTTP-level 4xx/5xx responses are
//! ordinary responses; use [`fetch_ok`](HttpClient::fetch_ok) to turn them
//! into errors.

use std::future::Future;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::client::legacy::Client as PoolClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;

use crate::body::{self, ByteStream};
use crate::http::{Body, Request, Response, get_header};
use crate::{Error, HttpError, Result};

type BackendBody = http_body_util::combinators::UnsyncBoxBody<Bytes, Error>;

/// A client capable of streaming fetches with cancellation.
pub trait HttpClient: Send + Sync + 'static {
    /// Starts `request` and resolves once the response head has arrived.
    ///
    /// The response body is pulled lazily; dropping it abandons the
    /// transfer. `stop` aborts the fetch at the next I/O edge with
    /// [`Error::Cancelled`].
    fn fetch(
        &self,
        request: Request,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<Response>> + Send;

    /// Like [`fetch`](Self::fetch), but a non-`2xx` status drains the body
    /// and fails with [`HttpError`] carrying the status and the body text.
    fn fetch_ok(
        &self,
        request: Request,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<Response>> + Send {
        async move {
            let response = self.fetch(request, stop).await?;
            if response.status / 100 == 2 {
                Ok(response)
            } else {
                let status = i32::from(response.status);
                let message = body::collect_string(response.body).await?;
                Err(HttpError::with_message(status, message).into())
            }
        }
    }

    /// Fetches a bare URL with `GET`.
    fn fetch_url(
        &self,
        url: &str,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<Response>> + Send {
        self.fetch(Request::new(url), stop)
    }
}

/// The hyper-backed [`HttpClient`].
///
/// One shared connection pool drives every transfer; cloning the client
/// clones a handle onto the same pool.
#[derive(Clone, Debug)]
pub struct Client {
    inner: PoolClient<HttpConnector, BackendBody>,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            inner: PoolClient::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

impl Client {
    /// A client with default pooling.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpClient for Client {
    async fn fetch(&self, request: Request, stop: CancellationToken) -> Result<Response> {
        let backend_request = to_backend_request(request)?;
        let response = tokio::select! {
            response = self.inner.request(backend_request) => {
                response.map_err(|error| request_error(&error))?
            }
            _ = stop.cancelled() => return Err(Error::Cancelled),
        };

        let (parts, backend_body) = response.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Ok(Response {
            status: parts.status.as_u16(),
            headers,
            body: receive_body(backend_body, stop),
        })
    }
}

fn to_backend_request(request: Request) -> Result<hyper::Request<BackendBody>> {
    let Request {
        url,
        method,
        mut headers,
        body,
        ..
    } = request;

    let method = hyper::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| Error::invalid_argument("unsupported method"))?;
    let uri: hyper::Uri = url
        .parse()
        .map_err(|_| Error::invalid_argument(format!("invalid url: {url}")))?;
    if let Body::Full(data) = &body {
        if get_header(&headers, "Content-Length").is_none() {
            headers.push(("Content-Length".to_owned(), data.len().to_string()));
        }
    }

    let mut builder = hyper::Request::builder().method(method).uri(uri);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let backend_body = match body {
        Body::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
        Body::Full(data) => Full::new(data).map_err(|never| match never {}).boxed_unsync(),
        Body::Stream(stream) => {
            StreamBody::new(stream.map(|piece| piece.map(Frame::data))).boxed_unsync()
        }
    };
    builder
        .body(backend_body)
        .map_err(|error| Error::invalid_argument(error.to_string()))
}

/// The lazy response body: frames are only pulled when polled, transport
/// failures surface as [`HttpError`] sentinels, cancellation as
/// [`Error::Cancelled`].
fn receive_body(mut backend_body: Incoming, stop: CancellationToken) -> ByteStream {
    Box::pin(try_stream! {
        while let Some(data) = next_data_frame(&mut backend_body, &stop).await? {
            yield data;
        }
    })
}

/// The next non-empty data frame, `None` at the end of the body.
async fn next_data_frame(body: &mut Incoming, stop: &CancellationToken) -> Result<Option<Bytes>> {
    loop {
        let frame = tokio::select! {
            frame = body.frame() => frame,
            _ = stop.cancelled() => return Err(Error::Cancelled),
        };
        match frame {
            None => return Ok(None),
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        return Ok(Some(data));
                    }
                }
            }
            Some(Err(error)) => return Err(transfer_error(&error)),
        }
    }
}

fn request_error(error: &hyper_util::client::legacy::Error) -> Error {
    HttpError::with_message(HttpError::UNKNOWN, error.to_string()).into()
}

fn transfer_error(error: &hyper::Error) -> Error {
    HttpError::with_message(HttpError::ABORTED, error.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_bodies_get_a_content_length() {
        let request = Request::new("http://localhost/").body("payload");
        let backend = to_backend_request(request).unwrap();
        assert_eq!(backend.headers().get("content-length").unwrap(), "7");
    }

    #[test]
    fn caller_supplied_content_length_wins() {
        let request = Request::new("http://localhost/")
            .header("Content-Length", "3")
            .body("abc");
        let backend = to_backend_request(request).unwrap();
        let lengths: Vec<_> = backend.headers().get_all("content-length").iter().collect();
        assert_eq!(lengths.len(), 1);
        assert_eq!(lengths[0], "3");
    }

    #[test]
    fn webdav_methods_convert() {
        let request = Request::new("http://localhost/").method(crate::http::Method::Propfind);
        let backend = to_backend_request(request).unwrap();
        assert_eq!(backend.method().as_str(), "PROPFIND");
    }

    #[test]
    fn invalid_urls_are_rejected() {
        let request = Request::new("not a url");
        assert!(matches!(
            to_backend_request(request).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }
}
