//! Record-marking fragment reassembly.

use bytes::{Bytes, BytesMut};
use strand_core::conn::{ByteSource, MAX_BUFFER_SIZE};
use strand_core::{Error, Result};

use crate::xdr::padded_len;

const LAST_FRAGMENT: u32 = 1 << 31;

/// A pull-byte-source over one record's payload.
///
/// A record is a sequence of fragments, each prefixed with a big-endian
/// `u32` whose high bit flags the last fragment and whose low 31 bits are
/// the fragment length. `RecordSource` transparently consumes continuation
/// headers as fragments run dry; reading past the end of the final
/// fragment is a malformed request.
#[derive(Debug)]
pub struct RecordSource {
    source: ByteSource,
    remaining: u32,
    last: bool,
}

impl RecordSource {
    pub(crate) fn new(source: ByteSource, last: bool, remaining: u32) -> Self {
        Self {
            source,
            remaining,
            last,
        }
    }

    /// Reads from the record payload.
    ///
    /// `count == u32::MAX` returns the next available piece, empty once
    /// the record is exhausted; any other count returns exactly that many
    /// bytes or fails with `"buffer underflow"` when the record ends
    /// first.
    pub async fn read(&mut self, count: u32) -> Result<Bytes> {
        if count == 0 {
            return Ok(Bytes::new());
        }
        if count == u32::MAX {
            return self.read_any().await;
        }

        let mut assembled = BytesMut::with_capacity(count as usize);
        while (assembled.len() as u32) < count {
            if self.remaining == 0 {
                if self.last {
                    return Err(Error::malformed("buffer underflow"));
                }
                self.next_fragment().await?;
                continue;
            }
            let take = (count - assembled.len() as u32)
                .min(self.remaining)
                .min(MAX_BUFFER_SIZE as u32);
            let piece = self.source.read(take).await?;
            self.remaining -= take;
            assembled.extend_from_slice(&piece);
        }
        Ok(assembled.freeze())
    }

    async fn read_any(&mut self) -> Result<Bytes> {
        loop {
            if self.remaining == 0 {
                if self.last {
                    return Ok(Bytes::new());
                }
                self.next_fragment().await?;
                continue;
            }
            let data = self.source.read(u32::MAX).await?;
            if data.is_empty() {
                return Err(Error::Aborted);
            }
            let take = (self.remaining as usize).min(data.len());
            let mut piece = data;
            if piece.len() > take {
                self.source.unread(piece.split_off(take));
            }
            self.remaining -= piece.len() as u32;
            return Ok(piece);
        }
    }

    async fn next_fragment(&mut self) -> Result<()> {
        let header = self.source.read(4).await?;
        let value = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        self.last = value & LAST_FRAGMENT != 0;
        self.remaining = value & !LAST_FRAGMENT;
        Ok(())
    }

    /// Reads a big-endian `u32` from the payload.
    pub async fn read_u32(&mut self) -> Result<u32> {
        let data = self.read(4).await?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Reads a big-endian `u64` from the payload.
    pub async fn read_u64(&mut self) -> Result<u64> {
        let high = self.read_u32().await?;
        let low = self.read_u32().await?;
        Ok((u64::from(high) << 32) | u64::from(low))
    }

    /// Reads variable-length opaque data of at most `max_len` bytes,
    /// consuming its padding.
    pub async fn read_opaque(&mut self, max_len: u32) -> Result<Bytes> {
        let len = self.read_u32().await?;
        if len > max_len {
            return Err(Error::malformed("opaque length too long"));
        }
        let data = self.read(len).await?;
        let padding = (padded_len(len as usize) - len as usize) as u32;
        self.read(padding).await?;
        Ok(data)
    }

    /// Consumes and discards the rest of the record.
    pub async fn drain(&mut self) -> Result<()> {
        loop {
            if self.read(u32::MAX).await?.is_empty() {
                return Ok(());
            }
        }
    }
}
