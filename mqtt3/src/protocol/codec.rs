//! MQTT packet encoding/decoding utilities.
//!
//! Low-level primitives shared by the frame and packet codecs: the
//! remaining-length VarInt, big-endian integers and 2-byte length-prefixed
//! strings and blobs.

use crate::error::{Error, Result};

use super::buffer::BufferWriter;
use super::MAX_REMAINING_LENGTH;

/// Maximum number of bytes a remaining-length VarInt may occupy.
pub const MAX_VARIABLE_INT_LEN: usize = 4;

/// Encode a remaining-length VarInt into `out`.
///
/// Returns the number of bytes written.
pub fn encode_variable_int(value: u32, out: &mut BufferWriter) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::protocol(format!(
            "remaining length {} exceeds {}",
            value, MAX_REMAINING_LENGTH
        )));
    }

    let (digits, len) = variable_int_digits(value);
    out.put_slice(&digits[..len]);
    Ok(len)
}

/// Base-128 digits of `value`, least significant first, with the
/// continuation bit set on every byte but the last. `value` must already
/// be within [`MAX_REMAINING_LENGTH`].
pub(crate) fn variable_int_digits(mut value: u32) -> ([u8; MAX_VARIABLE_INT_LEN], usize) {
    let mut digits = [0u8; MAX_VARIABLE_INT_LEN];
    let mut i = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        digits[i] = byte;
        i += 1;
        if value == 0 || i == MAX_VARIABLE_INT_LEN {
            return (digits, i);
        }
    }
}

/// Decode a remaining-length VarInt from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the last digit, and a protocol
/// violation when a fourth byte still has its continuation bit set.
pub fn decode_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for (i, &byte) in buf.iter().take(MAX_VARIABLE_INT_LEN).enumerate() {
        value += (byte & 0x7F) as u32 * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i + 1 == MAX_VARIABLE_INT_LEN {
            return Err(Error::protocol("malformed remaining length"));
        }
        multiplier *= 128;
    }

    Ok(None)
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Write a single byte.
pub fn write_u8(out: &mut BufferWriter, value: u8) {
    out.claim(1)[0] = value;
    out.commit(1);
}

/// Write a 2-byte big-endian u16.
pub fn write_u16(out: &mut BufferWriter, value: u16) {
    out.claim(2)[..2].copy_from_slice(&value.to_be_bytes());
    out.commit(2);
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(out: &mut BufferWriter, s: &str) -> Result<()> {
    write_binary(out, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(out: &mut BufferWriter, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::protocol(format!("field of {} bytes exceeds 65535", data.len())))?;
    write_u16(out, len);
    out.put_slice(data);
    Ok(())
}

/// Cursor over a packet body.
///
/// Every read past the end of the body is a protocol violation: the frame
/// layer has already delivered the whole body, so a short read can only
/// mean a malformed packet.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "packet body too short: need {} more bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a length-prefixed blob.
    pub fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let raw = self.read_binary()?;
        std::str::from_utf8(raw).map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// Consume everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
