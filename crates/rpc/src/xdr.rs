//! XDR serialization primitives.
//!
//! Everything is big-endian and padded to a four-byte boundary. The
//! encoder appends to an owned buffer; the decoder walks a byte slice and
//! fails with a malformed-message error on underflow or length-limit
//! violations.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strand_core::{Error, Result};

/// `len` rounded up to a multiple of four.
#[inline]
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// An appending XDR writer.
#[derive(Debug, Default)]
pub struct XdrEncoder {
    buf: BytesMut,
}

impl XdrEncoder {
    /// An empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the encoder, yielding the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Appends a `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends an `i32`.
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    /// Appends a `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Appends a boolean as a `u32` 0 or 1.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u32(u32::from(value))
    }

    /// Appends an enum as its `u32` representation.
    pub fn put_enum(&mut self, value: impl Into<u32>) -> &mut Self {
        self.put_u32(value.into())
    }

    /// Appends variable-length opaque data: length, bytes, zero padding.
    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.put_opaque_fixed(data)
    }

    /// Appends fixed-size opaque data: bytes plus zero padding, no length.
    pub fn put_opaque_fixed(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self.buf.put_bytes(0, padded_len(data.len()) - data.len());
        self
    }

    /// Appends a string as variable-length opaque UTF-8.
    pub fn put_string(&mut self, text: &str) -> &mut Self {
        self.put_opaque(text.as_bytes())
    }

    /// Appends an optional: a `u32` discriminant, then the payload when
    /// present.
    pub fn put_optional<T>(
        &mut self,
        value: Option<&T>,
        encode: impl FnOnce(&mut Self, &T),
    ) -> &mut Self {
        match value {
            Some(value) => {
                self.put_u32(1);
                encode(self, value);
            }
            None => {
                self.put_u32(0);
            }
        }
        self
    }
}

/// A consuming XDR reader over a byte slice.
#[derive(Debug)]
pub struct XdrDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> XdrDecoder<'a> {
    /// A decoder over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { buf: data }
    }

    /// Bytes left to decode.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.buf.len() < count {
            Err(Error::malformed("buffer underflow"))
        } else {
            Ok(())
        }
    }

    /// Reads a `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Reads an `i32`.
    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// Reads a `u64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Reads a boolean; anything but 0 or 1 is malformed.
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::malformed(format!("invalid boolean: {other}"))),
        }
    }

    /// Reads variable-length opaque data of at most `max_len` bytes.
    pub fn get_opaque(&mut self, max_len: u32) -> Result<Bytes> {
        let len = self.get_u32()?;
        if len > max_len {
            return Err(Error::malformed("opaque length too long"));
        }
        self.get_opaque_fixed(len as usize)
    }

    /// Reads `len` bytes of fixed-size opaque data plus its padding.
    pub fn get_opaque_fixed(&mut self, len: usize) -> Result<Bytes> {
        let padded = padded_len(len);
        self.need(padded)?;
        let data = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(padded);
        Ok(data)
    }

    /// Reads a string of at most `max_len` bytes; must be valid UTF-8.
    pub fn get_string(&mut self, max_len: u32) -> Result<String> {
        let data = self.get_opaque(max_len)?;
        String::from_utf8(data.to_vec()).map_err(|_| Error::malformed("invalid utf-8 string"))
    }

    /// Reads an optional via the `u32` discriminant.
    pub fn get_optional<T>(
        &mut self,
        decode: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.get_u32()? {
            0 => Ok(None),
            1 => Ok(Some(decode(self)?)),
            other => Err(Error::malformed(format!("invalid optional tag: {other}"))),
        }
    }
}
