//! Streaming byte sequences.
//!
//! A [`ByteStream`] is the toolkit's lazy byte generator: a single-pass,
//! suspend-capable sequence of [`Bytes`] chunks. Dropping the stream drops
//! its producer, cancelling whatever the producer was waiting on.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::Result;

/// A lazy stream of byte chunks; the body type used by the HTTP layers.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A stream with no chunks at all.
pub fn empty() -> ByteStream {
    stream::empty().boxed()
}

/// A stream yielding `data` as a single chunk (nothing for empty input).
pub fn full(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    if data.is_empty() {
        empty()
    } else {
        stream::once(async move { Ok(data) }).boxed()
    }
}

/// Collects a stream into one contiguous buffer.
pub async fn collect(mut body: ByteStream) -> Result<Bytes> {
    let mut data = BytesMut::new();
    while let Some(chunk) = body.try_next().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

/// Collects a stream into a string, replacing invalid UTF-8.
pub async fn collect_string(body: ByteStream) -> Result<String> {
    let data = collect(body).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Consumes and discards the rest of a stream.
pub async fn drain(mut body: ByteStream) -> Result<()> {
    while body.try_next().await?.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn full_roundtrips_through_collect() {
        let body = full("response");
        assert_eq!(collect(body).await.unwrap(), Bytes::from("response"));
    }

    #[tokio::test]
    async fn empty_input_produces_no_chunks() {
        let mut body = full("");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn drain_discards_all_chunks() {
        let body = stream::iter([Ok(Bytes::from("a")), Ok(Bytes::from("b"))]).boxed();
        drain(body).await.unwrap();
    }

    #[tokio::test]
    async fn collect_surfaces_producer_errors() {
        let body = stream::iter([Ok(Bytes::from("a")), Err(Error::Aborted)]).boxed();
        assert_eq!(collect(body).await.unwrap_err(), Error::Aborted);
    }
}
