//! TCP connection substrate.
//!
//! Every accepted connection is owned by exactly one task. That task runs a
//! buffer pump (socket → shared read buffer, paused at the
//! [`MAX_BUFFER_SIZE`] watermark) and repeatedly hands the connection to a
//! [`ConnectionHandler`] as a pair:
//!
//! - a [`ByteSource`], the pull side: `read(n)` returns exactly `n` bytes,
//!   or whatever is buffered for `n == u32::MAX`;
//! - a [`ChunkStream`], the push side: every non-empty [`Chunk`] the
//!   handler yields is written to the socket, one write at a time.
//!
//! Peer EOF or reset cancels the connection's stop token, which aborts any
//! pending read or write. [`TcpServer::quit`] cancels every connection
//! token through the server token and waits until all connection tasks
//! have drained.

mod server;
mod source;

use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use server::{ServerConfig, TcpServer};
pub use source::ByteSource;

use crate::Result;

/// Read watermark: the buffer pump pauses once this many bytes are queued,
/// and no single [`ByteSource::read`] may ask for more.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024;

/// One response fragment pushed by a connection handler.
///
/// The sink does not frame; framing (chunked encoding, record marking) is
/// the protocol layer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw bytes.
    Bytes(Bytes),
    /// Text, written as its UTF-8 bytes.
    Text(String),
}

impl Chunk {
    /// The wire bytes of this chunk.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(data) => data,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Whether the chunk carries no bytes. Empty chunks are skipped by the
    /// connection writer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Self::Bytes(data)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(data.into())
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&'static str> for Chunk {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// The push-chunk-sink produced by a handler for one protocol message.
pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// A protocol engine driving one connection.
///
/// `handle` is invoked once per protocol message; the returned stream
/// borrows the source handle for the duration of the exchange and yields
/// the bytes to put on the wire. Erroring the stream terminates the
/// connection; ending it cleanly lets the server invoke `handle` again for
/// the next message on the same connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Produces the response chunk stream for the next message.
    fn handle(&self, source: ByteSource, stop: crate::sync::CancellationToken) -> ChunkStream;
}
