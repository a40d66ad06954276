//! # Wire Codec
//!
//! Value-typed builder and parser for the protocol's binary records. All
//! multi-byte integers are big-endian; fields are packed with no padding.
//! The builder supports back-patching (the client hello carries its own
//! total length at a fixed offset, written after the fact); the parser
//! fails with a short-read error instead of panicking when a record is
//! truncated.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Builder for outgoing records.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Create a builder with a capacity hint.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn put_slice(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Overwrite a previously written big-endian `u16` at `offset`.
    ///
    /// Panics if the two bytes at `offset` have not been written yet;
    /// back-patching is only meaningful for reserved fields.
    pub fn patch_u16(&mut self, offset: usize, value: u16) -> &mut Self {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        self
    }

    /// Freeze into an immutable buffer.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Parser over a received record.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(ProtocolError::ShortRead {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> ProtocolResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> ProtocolResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read `count` raw bytes.
    pub fn get_slice(&mut self, count: usize) -> ProtocolResult<&'a [u8]> {
        self.take(count)
    }

    /// Read a fixed-size array.
    pub fn get_array<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read everything left.
    pub fn get_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Fail with `malformed` unless `actual == expected`.
    pub fn expect_u8(&mut self, expected: u8, what: &str) -> ProtocolResult<()> {
        let actual = self.get_u8()?;
        if actual != expected {
            return Err(ProtocolError::Malformed(format!(
                "{}: expected 0x{:02x}, got 0x{:02x}",
                what, expected, actual
            )));
        }
        Ok(())
    }
}
