//! The HTTP/1.1 server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::parse::{BodyKind, BodyReader, body_kind, body_stream, drain_body, read_head};
use super::{Body, Headers, Method, Request, Response, get_header, has_header, status_text};
use crate::conn::{ByteSource, Chunk, ChunkStream, ConnectionHandler, ServerConfig, TcpServer};
use crate::{Error, Result};

/// The application side of the HTTP server.
///
/// The handler receives the parsed request, with its body still streaming
/// off the socket, and a stop token scoped to the connection; it returns a
/// response whose body may in turn be produced lazily. The server drives
/// the response body to completion on every path.
pub trait HttpHandler: Send + Sync + 'static {
    /// Handles one request.
    fn handle(
        &self,
        request: Request,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<Response>> + Send;
}

impl<F, Fut> HttpHandler for F
where
    F: Fn(Request, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn handle(
        &self,
        request: Request,
        stop: CancellationToken,
    ) -> impl Future<Output = Result<Response>> + Send {
        self(request, stop)
    }
}

/// An HTTP/1.1 server bound to one listener.
///
/// ```no_run
/// use strand_core::http::{HttpServer, Response};
/// use strand_core::conn::ServerConfig;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> strand_core::Result<()> {
/// let server = HttpServer::bind(
///     |_request, _stop| async { Ok(Response::new(200).body_full("hello")) },
///     &ServerConfig { address: "127.0.0.1".into(), port: 8080 },
/// )
/// .await?;
/// // ... later:
/// server.quit().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpServer {
    inner: TcpServer,
}

impl HttpServer {
    /// Binds the listener and starts serving.
    pub async fn bind<H: HttpHandler>(handler: H, config: &ServerConfig) -> Result<Self> {
        let inner = TcpServer::bind(
            HttpConnection {
                handler: Arc::new(handler),
            },
            config,
        )
        .await?;
        Ok(Self { inner })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    /// Stops accepting and waits for in-flight connections to drain.
    pub async fn quit(&self) {
        self.inner.quit().await;
    }
}

struct HttpConnection<H> {
    handler: Arc<H>,
}

impl<H: HttpHandler> ConnectionHandler for HttpConnection<H> {
    fn handle(&self, source: ByteSource, stop: CancellationToken) -> ChunkStream {
        let handler = Arc::clone(&self.handler);
        Box::pin(try_stream! {
            let parsed = parse_request(&source).await;
            match parsed {
                Err(error) if error.is_disconnect() => {
                    bail(error)?;
                }
                Err(error) => {
                    // The head never parsed; answer and give the
                    // connection up.
                    for chunk in error_payload(&error, Method::Get, true) {
                        yield chunk;
                    }
                    bail(Error::Aborted)?;
                }
                Ok((head, kind)) => {
                    let method = head.method;
                    let reader = Arc::new(BodyReader::new(source.clone(), kind));
                    if has_header(&head.headers, "Expect", "100-continue") {
                        yield Chunk::from("HTTP/1.1 100 Continue\r\n\r\n");
                    }
                    let body = match kind {
                        BodyKind::Empty => Body::Empty,
                        _ => Body::Stream(body_stream(Arc::clone(&reader))),
                    };
                    let request = Request {
                        url: head.target,
                        method,
                        headers: head.headers,
                        body,
                        flags: enumflags2::BitFlags::empty(),
                    };

                    match handler.handle(request, stop.clone()).await {
                        Err(error) => {
                            let close = reader.failed();
                            if !close {
                                drain_body(&reader).await?;
                            }
                            tracing::debug!(%error, "handler failed before streaming");
                            for chunk in error_payload(&error, method, close) {
                                yield chunk;
                            }
                            if close {
                                bail(Error::Aborted)?;
                            }
                        }
                        Ok(response) => {
                            let Response { status, mut headers, body } = response;
                            let content_length = get_header(&headers, "Content-Length")
                                .and_then(|value| value.trim().parse::<u64>().ok());
                            let chunked = get_header(&headers, "Content-Length").is_none();
                            let has_body = response_has_body(status, content_length);

                            if method == Method::Head || !has_body {
                                drain_body(&reader).await?;
                            }
                            if chunked && has_body {
                                headers.push((
                                    "Transfer-Encoding".to_owned(),
                                    "chunked".to_owned(),
                                ));
                            }
                            headers.push(("Connection".to_owned(), "keep-alive".to_owned()));
                            yield Chunk::Bytes(serialize_head(status, &headers));

                            if method != Method::Head && has_body {
                                let mut body = body;
                                // One chunk of lookahead, so the request
                                // body can be drained before the final
                                // write of a non-chunked response.
                                let mut pending: Option<Bytes> = None;
                                let mut failure: Option<Error> = None;
                                loop {
                                    match body.next().await {
                                        Some(Ok(piece)) => {
                                            if piece.is_empty() {
                                                continue;
                                            }
                                            if let Some(previous) = pending.replace(piece) {
                                                yield encode_piece(previous, chunked);
                                            }
                                        }
                                        Some(Err(error)) => {
                                            failure = Some(error);
                                            break;
                                        }
                                        None => break,
                                    }
                                }
                                match failure {
                                    Some(error) if chunked => {
                                        // The head is out; report in band
                                        // and keep the connection alive.
                                        tracing::debug!(%error, "response body failed mid-stream");
                                        let text = Bytes::from(format!("{error}\n"));
                                        yield encode_piece(text, true);
                                        yield Chunk::from("0\r\n\r\n");
                                    }
                                    Some(error) => {
                                        bail(error)?;
                                    }
                                    None => {
                                        if let Some(last) = pending {
                                            if !chunked {
                                                drain_body(&reader).await?;
                                            }
                                            yield encode_piece(last, chunked);
                                        }
                                        if chunked {
                                            drain_body(&reader).await?;
                                            yield Chunk::from("0\r\n\r\n");
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

fn bail(error: Error) -> Result<()> {
    Err(error)
}

async fn parse_request(
    source: &ByteSource,
) -> Result<(super::parse::RequestHead, BodyKind)> {
    let head = read_head(source).await?;
    let kind = body_kind(&head.headers)?;
    Ok((head, kind))
}

/// Whether a response with this status carries a body; an explicit
/// positive `Content-Length` forces one.
fn response_has_body(status: u16, content_length: Option<u64>) -> bool {
    (status / 100 != 1 && status != 204 && status != 304)
        || content_length.is_some_and(|length| length > 0)
}

fn serialize_head(status: u16, headers: &Headers) -> Bytes {
    let mut head = BytesMut::new();
    head.put_slice(format!("HTTP/1.1 {status} {}\r\n", status_text(status)).as_bytes());
    for (name, value) in headers {
        head.put_slice(name.as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"\r\n");
    head.freeze()
}

fn encode_piece(piece: Bytes, chunked: bool) -> Chunk {
    if !chunked {
        return Chunk::Bytes(piece);
    }
    let mut framed = BytesMut::with_capacity(piece.len() + 16);
    framed.put_slice(format!("{:x}\r\n", piece.len()).as_bytes());
    framed.put_slice(&piece);
    framed.put_slice(b"\r\n");
    Chunk::Bytes(framed.freeze())
}

/// The synthesized response for an error caught before any head was
/// written: a status derived from the error, a plain-text body, and
/// keep-alive unless the request state is beyond recovery.
fn error_payload(error: &Error, method: Method, close: bool) -> Vec<Chunk> {
    let status = error_status(error);
    let text = format!("{error}\n");
    let headers: Headers = vec![
        ("Content-Type".to_owned(), "text/plain; charset=utf-8".to_owned()),
        ("Content-Length".to_owned(), text.len().to_string()),
        (
            "Connection".to_owned(),
            if close { "close" } else { "keep-alive" }.to_owned(),
        ),
    ];
    let mut chunks = vec![Chunk::Bytes(serialize_head(status, &headers))];
    if method != Method::Head && response_has_body(status, None) {
        chunks.push(Chunk::Text(text));
    }
    chunks
}

fn error_status(error: &Error) -> u16 {
    match error {
        Error::Http(http) if (100..600).contains(&http.status) => http.status as u16,
        _ => 500,
    }
}


#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn has_body_rule() {
        assert!(response_has_body(200, None));
        assert!(!response_has_body(204, None));
        assert!(!response_has_body(304, None));
        assert!(!response_has_body(100, None));
        assert!(response_has_body(204, Some(4)));
        assert!(!response_has_body(204, Some(0)));
    }

    #[test]
    fn head_serialization_preserves_header_case_and_order() {
        let headers = vec![
            ("X-First".to_owned(), "1".to_owned()),
            ("x-second".to_owned(), "2".to_owned()),
        ];
        let head = serialize_head(200, &headers);
        assert_eq!(
            head,
            Bytes::from("HTTP/1.1 200 OK\r\nX-First: 1\r\nx-second: 2\r\n\r\n")
        );
    }

    #[test]
    fn chunk_framing_is_hex_prefixed() {
        let piece = encode_piece(Bytes::from("response"), true);
        assert_eq!(piece.as_bytes(), b"8\r\nresponse\r\n");
    }

    #[test]
    fn error_statuses_clamp_to_500() {
        assert_eq!(error_status(&Error::Aborted), 500);
        assert_eq!(error_status(&crate::HttpError::new(404).into()), 404);
        assert_eq!(
            error_status(&crate::HttpError::new(crate::HttpError::ABORTED).into()),
            500
        );
    }
}
