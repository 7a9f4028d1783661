//! Compact binary encoding used by every wire record.
//!
//! Integers are varints: values below `0xfd` take one byte, larger values
//! are prefixed with `0xfd` (u16), `0xfe` (u32) or `0xff` (u64), all little
//! endian. Byte strings and UTF-8 strings are a varint length followed by
//! the raw bytes. Fixed 32-byte keys are written verbatim.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::core::Key;

/// Errors produced while decoding a wire record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEnd { needed: usize },
    #[error("length {0} does not fit in memory")]
    LengthOverflow(u64),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("invalid flags {0:#x}")]
    InvalidFlags(u64),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("unknown response status {0}")]
    UnknownStatus(u8),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Append-only writer for compact records.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a compact varint.
    pub fn uint(&mut self, value: u64) -> &mut Self {
        if value < 0xfd {
            self.buf.push(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.push(0xfd);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= u32::MAX as u64 {
            self.buf.push(0xfe);
            self.buf.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.buf.push(0xff);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16_le(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn fixed32(&mut self, key: &Key) -> &mut Self {
        self.buf.extend_from_slice(key);
        self
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.uint(data.len() as u64);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn ipv4(&mut self, addr: Ipv4Addr, port: u16) -> &mut Self {
        self.buf.extend_from_slice(&addr.octets());
        self.u16_le(port)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded record.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEnd {
                needed: len - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a compact varint.
    pub fn uint(&mut self) -> Result<u64, DecodeError> {
        match self.u8()? {
            0xfd => Ok(u16::from_le_bytes(self.array()?) as u64),
            0xfe => Ok(u32::from_le_bytes(self.array()?) as u64),
            0xff => Ok(u64::from_le_bytes(self.array()?)),
            small => Ok(small as u64),
        }
    }

    /// A varint used as a length or count.
    pub fn length(&mut self) -> Result<usize, DecodeError> {
        let value = self.uint()?;
        usize::try_from(value).map_err(|_| DecodeError::LengthOverflow(value))
    }

    pub fn fixed32(&mut self) -> Result<Key, DecodeError> {
        self.array()
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.length()?;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.bytes()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn ipv4(&mut self) -> Result<(Ipv4Addr, u16), DecodeError> {
        let octets: [u8; 4] = self.array()?;
        let port = self.u16_le()?;
        Ok((Ipv4Addr::from(octets), port))
    }

    /// Fail if any input is left over.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
