//! HTTP/1.1 request grammar: head reading and body framing.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::try_stream;
use bytes::{Buf, Bytes, BytesMut};
use regex::Regex;

use super::{Headers, Method, get_header};
use crate::body::ByteStream;
use crate::conn::ByteSource;
use crate::{Error, HttpError, Result};

/// Reject heads that exceed this many bytes in total.
pub(crate) const MAX_HEADER_SIZE: usize = 16 * 1024;
/// The request line must terminate within this many bytes.
pub(crate) const MAX_REQUEST_LINE: usize = 4096;
/// Reject requests with more headers than this.
pub(crate) const MAX_HEADER_COUNT: usize = 128;
/// Chunk-size lines carry at most this many hex digits.
pub(crate) const MAX_CHUNK_SIZE_DIGITS: usize = 8;

static REQUEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]+) (\S+) HTTP/1\.[01]$").expect("request line regex"));
static HEADER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+):\s*(.+)$").expect("header line regex"));

/// The parsed request line and headers.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) headers: Headers,
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Fixed(u64),
    Chunked,
}

fn bad_request(message: &str) -> Error {
    HttpError::with_message(400, message).into()
}

/// Reads one CRLF-terminated line, pushing unconsumed bytes back into the
/// source. `overflow` supplies the error when the line exceeds `limit`.
async fn read_line(
    source: &ByteSource,
    limit: usize,
    overflow: impl Fn() -> Error,
) -> Result<String> {
    let mut acc = BytesMut::new();
    let mut scanned = 0usize;
    loop {
        if let Some(at) = acc[scanned..].windows(2).position(|pair| pair == b"\r\n") {
            let end = scanned + at;
            if end > limit {
                return Err(overflow());
            }
            let line = acc.split_to(end);
            acc.advance(2);
            source.unread(acc.freeze());
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        scanned = acc.len().saturating_sub(1);
        if acc.len() > limit {
            return Err(overflow());
        }
        let data = source.read(u32::MAX).await?;
        if data.is_empty() {
            return Err(Error::Aborted);
        }
        acc.extend_from_slice(&data);
    }
}

/// Reads and validates the request line and headers.
pub(crate) async fn read_head(source: &ByteSource) -> Result<RequestHead> {
    let request_line = read_line(source, MAX_REQUEST_LINE, || HttpError::new(414).into()).await?;
    let captures = REQUEST_LINE
        .captures(&request_line)
        .ok_or_else(|| bad_request("malformed request line"))?;
    let method = captures[1]
        .parse::<Method>()
        .map_err(|_| Error::from(HttpError::new(501)))?;
    let target = captures[2].to_owned();

    let mut headers = Headers::new();
    let mut head_size = request_line.len() + 2;
    loop {
        let remaining = MAX_HEADER_SIZE.saturating_sub(head_size);
        let line = read_line(source, remaining, || HttpError::new(431).into()).await?;
        head_size += line.len() + 2;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(HttpError::with_message(431, "too many headers").into());
        }
        let captures = HEADER_LINE
            .captures(&line)
            .ok_or_else(|| bad_request("malformed header"))?;
        headers.push((captures[1].to_owned(), captures[2].to_owned()));
    }
    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Classifies the body framing from the request headers.
pub(crate) fn body_kind(headers: &[(String, String)]) -> Result<BodyKind> {
    let chunked = headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("Transfer-Encoding") && value.contains("chunked")
    });
    let content_length = get_header(headers, "Content-Length");
    if chunked {
        if content_length.is_some() {
            return Err(bad_request("both Transfer-Encoding and Content-Length"));
        }
        return Ok(BodyKind::Chunked);
    }
    match content_length {
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| bad_request("invalid Content-Length"))?;
            Ok(if length == 0 {
                BodyKind::Empty
            } else {
                BodyKind::Fixed(length)
            })
        }
        None => Ok(BodyKind::Empty),
    }
}

/// Shared request-body progress.
///
/// The handler's body stream and the server's post-response drain advance
/// the same state, so whatever the handler leaves unconsumed can still be
/// flushed to keep the connection reusable. A framing error poisons the
/// reader and forces the connection closed.
pub(crate) struct BodyReader {
    source: ByteSource,
    state: tokio::sync::Mutex<Progress>,
    failed: AtomicBool,
}

enum Progress {
    Fixed { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    Done,
}

impl BodyReader {
    pub(crate) fn new(source: ByteSource, kind: BodyKind) -> Self {
        let progress = match kind {
            BodyKind::Empty => Progress::Done,
            BodyKind::Fixed(length) => Progress::Fixed { remaining: length },
            BodyKind::Chunked => Progress::ChunkSize,
        };
        Self {
            source,
            state: tokio::sync::Mutex::new(progress),
            failed: AtomicBool::new(false),
        }
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The next piece of decoded body, `None` at the end.
    pub(crate) async fn next_piece(&self) -> Result<Option<Bytes>> {
        if self.failed() {
            return Err(Error::Aborted);
        }
        let mut progress = self.state.lock().await;
        let result = self.advance(&mut progress).await;
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn advance(&self, progress: &mut Progress) -> Result<Option<Bytes>> {
        loop {
            match progress {
                Progress::Done => return Ok(None),
                Progress::Fixed { remaining } => {
                    let piece = self.read_capped(remaining).await?;
                    if *remaining == 0 {
                        *progress = Progress::Done;
                    }
                    return Ok(Some(piece));
                }
                Progress::ChunkSize => {
                    let line =
                        read_line(&self.source, MAX_HEADER_SIZE, || bad_request("chunk size"))
                            .await?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.expect_crlf().await?;
                        *progress = Progress::Done;
                        return Ok(None);
                    }
                    *progress = Progress::ChunkData { remaining: size };
                }
                Progress::ChunkData { remaining } => {
                    let piece = self.read_capped(remaining).await?;
                    if *remaining == 0 {
                        self.expect_crlf().await?;
                        *progress = Progress::ChunkSize;
                    }
                    return Ok(Some(piece));
                }
            }
        }
    }

    /// Reads up to `*remaining` bytes, pushing any surplus back.
    async fn read_capped(&self, remaining: &mut u64) -> Result<Bytes> {
        let data = self.source.read(u32::MAX).await?;
        if data.is_empty() {
            return Err(Error::Aborted);
        }
        let take = usize::try_from(*remaining).unwrap_or(usize::MAX).min(data.len());
        let mut piece = data;
        if piece.len() > take {
            let surplus = piece.split_off(take);
            self.source.unread(surplus);
        }
        *remaining -= piece.len() as u64;
        Ok(piece)
    }

    async fn expect_crlf(&self) -> Result<()> {
        let line = read_line(&self.source, 0, || bad_request("missing chunk separator")).await?;
        if line.is_empty() {
            Ok(())
        } else {
            Err(bad_request("missing chunk separator"))
        }
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty()
        || digits.len() > MAX_CHUNK_SIZE_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(bad_request("invalid chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| bad_request("invalid chunk size"))
}

/// The handler-facing body stream over a shared [`BodyReader`].
pub(crate) fn body_stream(reader: Arc<BodyReader>) -> ByteStream {
    Box::pin(try_stream! {
        while let Some(piece) = reader.next_piece().await? {
            yield piece;
        }
    })
}

/// Consumes whatever is left of the request body.
pub(crate) async fn drain_body(reader: &BodyReader) -> Result<()> {
    while reader.next_piece().await?.is_some() {}
    Ok(())
}
