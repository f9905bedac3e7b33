// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed binary message framing.
//!
//! Every message on the wire is
//!
//! ```text
//! +-------------+-----------+------------------+
//! | u32 LE len  | u32 LE    |  payload bytes   |
//! | (code+data) | code      |                  |
//! +-------------+-----------+------------------+
//! ```
//!
//! The same numeric code space is reused by the server, peer and distributed
//! namespaces; the kind of the owning connection decides which enum a code is
//! decoded into. Codes are serialized with their native value, never
//! renumbered.
//!
//! Payload primitives: `u8`, `i32` little-endian, `i64` little-endian,
//! strings as `i32` byte-length followed by UTF-8 bytes, and raw byte runs.
//! A payload may be zlib-compressed as a whole; [`MessageReader::decompress`]
//! inflates it in place.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compression, bufread::ZlibDecoder, bufread::ZlibEncoder};

use crate::error::CodecError;

/// Bytes occupied by the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Bytes occupied by the message code.
pub const CODE_LEN: usize = 4;

/// A single decoded wire frame: the numeric code plus its raw payload.
///
/// The payload here is exactly the bytes after the code; whether they are
/// compressed is message-specific and resolved by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(code: u32, payload: Bytes) -> Self {
        Self { code, payload }
    }

    /// Total size of the frame on the wire, including the length prefix.
    pub fn wire_len(&self) -> usize {
        LENGTH_PREFIX_LEN + CODE_LEN + self.payload.len()
    }

    /// Serialize the frame: `len(code + payload)` prefix, code, payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32_le((CODE_LEN + self.payload.len()) as u32);
        buf.put_u32_le(self.code);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one complete frame from a buffer that starts at a length prefix.
    /// The buffer must hold the whole frame.
    pub fn from_frame(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < LENGTH_PREFIX_LEN + CODE_LEN {
            return Err(CodecError::TruncatedField {
                what: "frame header",
                offset: 0,
                len: buf.len(),
            });
        }
        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let end = LENGTH_PREFIX_LEN + declared;
        if declared < CODE_LEN || buf.len() < end {
            return Err(CodecError::TruncatedField {
                what: "frame payload",
                offset: LENGTH_PREFIX_LEN,
                len: buf.len(),
            });
        }
        let code = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            code,
            payload: Bytes::copy_from_slice(&buf[LENGTH_PREFIX_LEN + CODE_LEN..end]),
        })
    }
}

/// Fluent builder for outgoing messages.
///
/// Field writers append to the payload in call order; [`MessageBuilder::build`]
/// prepends the code and length prefix. [`MessageBuilder::compress`] marks the
/// payload for zlib deflation at build time.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    code: u32,
    payload: Vec<u8>,
    compress: bool,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_code(mut self, code: impl Into<u32>) -> Self {
        self.code = code.into();
        self
    }

    pub fn write_byte(mut self, v: u8) -> Self {
        self.payload.push(v);
        self
    }

    pub fn write_i32(mut self, v: i32) -> Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u32(mut self, v: u32) -> Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_i64(mut self, v: i64) -> Self {
        self.payload.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_u64(mut self, v: u64) -> Self {
        self.write_i64(v as i64)
    }

    /// `i32` byte-length prefix followed by the UTF-8 bytes.
    pub fn write_string(mut self, s: &str) -> Self {
        self.payload
            .extend_from_slice(&(s.len() as i32).to_le_bytes());
        self.payload.extend_from_slice(s.as_bytes());
        self
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Mark the payload for zlib compression at build time.
    pub fn compress(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn build(self) -> Result<Message, CodecError> {
        let payload = if self.compress {
            let mut enc = ZlibEncoder::new(self.payload.as_slice(), Compression::default());
            let mut out = Vec::with_capacity(self.payload.len() / 2 + 16);
            enc.read_to_end(&mut out).map_err(CodecError::Compress)?;
            Bytes::from(out)
        } else {
            Bytes::from(self.payload)
        };
        Ok(Message {
            code: self.code,
            payload,
        })
    }
}

/// Cursor over a message payload.
///
/// All reads advance the cursor; reading past the end of the payload fails
/// with [`CodecError::TruncatedField`]. Strings whose length prefix points
/// beyond the payload fail with [`CodecError::StringOverrun`].
#[derive(Debug)]
pub struct MessageReader {
    payload: Bytes,
    pos: usize,
}

impl MessageReader {
    pub fn new(msg: &Message) -> Self {
        Self {
            payload: msg.payload.clone(),
            pos: 0,
        }
    }

    pub fn from_payload(payload: Bytes) -> Self {
        Self { payload, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.payload.len()
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), CodecError> {
        if pos > self.payload.len() {
            return Err(CodecError::SeekOutOfBounds {
                pos,
                len: self.payload.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Inflate the whole payload in place and rewind the cursor.
    pub fn decompress(&mut self) -> Result<(), CodecError> {
        let mut dec = ZlibDecoder::new(&self.payload[..]);
        let mut out = Vec::with_capacity(self.payload.len() * 4);
        dec.read_to_end(&mut out).map_err(CodecError::Decompress)?;
        self.payload = Bytes::from(out);
        self.pos = 0;
        Ok(())
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], CodecError> {
        if self.pos + n > self.payload.len() {
            return Err(CodecError::TruncatedField {
                what,
                offset: self.pos,
                len: self.payload.len(),
            });
        }
        let out = &self.payload[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read an embedded `u32` message code.
    pub fn read_code(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4, "code")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1, "byte")?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.read_i32()? as u32)
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8, "i64")?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.read_i64()? as u64)
    }

    /// Four wire octets in reversed order forming the host-order address.
    pub fn read_ip(&mut self) -> Result<std::net::Ipv4Addr, CodecError> {
        Ok(std::net::Ipv4Addr::from(self.read_u32()?))
    }

    /// `i32` length prefix followed by that many bytes. The network predates
    /// strict UTF-8 clients, so invalid sequences are replaced, not rejected.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let start = self.pos;
        let declared = self.read_i32()?;
        if declared < 0 {
            return Err(CodecError::StringOverrun {
                declared: declared as i64,
                offset: start,
                len: self.payload.len(),
            });
        }
        let declared = declared as usize;
        if self.pos + declared > self.payload.len() {
            return Err(CodecError::StringOverrun {
                declared: declared as i64,
                offset: start,
                len: self.payload.len(),
            });
        }
        let raw = &self.payload[self.pos..self.pos + declared];
        self.pos += declared;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, CodecError> {
        if self.pos + n > self.payload.len() {
            return Err(CodecError::TruncatedField {
                what: "bytes",
                offset: self.pos,
                len: self.payload.len(),
            });
        }
        let out = self.payload.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }
}
