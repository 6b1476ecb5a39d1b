//! Frame codec: fixed header byte, remaining length and body.
//!
//! A [`Frame`] knows nothing about packet semantics. Its body borrows from
//! the read buffer whenever the bytes are contiguous, and only becomes an
//! owned copy when the body straddles several input segments or is detached
//! with [`Frame::into_owned`].

use std::borrow::Cow;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::types::PacketType;

use super::buffer::BufferWriter;
use super::codec::{MAX_VARIABLE_INT_LEN, decode_variable_int, encode_variable_int, write_u8};
use super::MAX_REMAINING_LENGTH;

/// Largest span claimed at once while copying a body into the output.
const WRITE_CHUNK: usize = 4096;

/// One MQTT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    header: u8,
    body: Cow<'a, [u8]>,
}

impl<'a> Frame<'a> {
    pub fn new(header: u8, body: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// The fixed header byte.
    pub fn header(&self) -> u8 {
        self.header
    }

    /// Low nibble of the fixed header.
    pub fn flags(&self) -> u8 {
        self.header & 0x0F
    }

    pub fn packet_type(&self) -> Result<PacketType> {
        PacketType::from_header(self.header)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the body still points into the input it was parsed from.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.body, Cow::Borrowed(_))
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + super::variable_int_len(self.body.len() as u32) + self.body.len()
    }

    /// Detach the frame from the buffer it was parsed from.
    pub fn into_owned(self) -> Frame<'static> {
        Frame {
            header: self.header,
            body: Cow::Owned(self.body.into_owned()),
        }
    }

    /// Append this frame, byte for byte, to `out`.
    pub fn write_to(&self, out: &mut BufferWriter) -> Result<()> {
        write_frame(self.header, &self.body, out)
    }

    /// Parse one frame from the start of a contiguous buffer.
    ///
    /// Returns the frame and the number of bytes it occupies, or `Ok(None)`
    /// if `buf` does not hold a whole frame yet. Nothing is consumed; the
    /// caller drops `consumed` bytes once it is done with the frame.
    pub fn parse(buf: &'a [u8]) -> Result<Option<(Frame<'a>, usize)>> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let Some((len, len_bytes)) = decode_variable_int(&buf[1..])? else {
            return Ok(None);
        };
        let start = 1 + len_bytes;
        let end = start + len as usize;
        if buf.len() < end {
            return Ok(None);
        }
        Ok(Some((Frame::new(header, &buf[start..end]), end)))
    }

    /// Parse one frame from input split across several segments.
    ///
    /// The body is borrowed when it lies inside a single segment and copied
    /// otherwise.
    pub fn parse_segments(segments: &[&'a [u8]]) -> Result<Option<(Frame<'a>, usize)>> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        let mut bytes = segments.iter().flat_map(|s| s.iter().copied());

        let Some(header) = bytes.next() else {
            return Ok(None);
        };
        let mut lookahead = [0u8; MAX_VARIABLE_INT_LEN];
        let mut seen = 0;
        for (slot, byte) in lookahead.iter_mut().zip(bytes) {
            *slot = byte;
            seen += 1;
        }
        let Some((len, len_bytes)) = decode_variable_int(&lookahead[..seen])? else {
            return Ok(None);
        };

        let start = 1 + len_bytes;
        let end = start + len as usize;
        if total < end {
            return Ok(None);
        }
        Ok(Some((
            Frame {
                header,
                body: body_span(segments, start, end),
            },
            end,
        )))
    }
}

fn body_span<'a>(segments: &[&'a [u8]], start: usize, end: usize) -> Cow<'a, [u8]> {
    if start == end {
        return Cow::Borrowed(&[]);
    }

    let mut owned: Option<Vec<u8>> = None;
    let mut offset = 0;
    for seg in segments {
        let seg_start = offset;
        let seg_end = offset + seg.len();
        offset = seg_end;
        if seg_end <= start {
            continue;
        }
        if seg_start >= end {
            break;
        }

        let from = start.saturating_sub(seg_start);
        let to = (end - seg_start).min(seg.len());
        if owned.is_none() && seg_start <= start && end <= seg_end {
            return Cow::Borrowed(&seg[from..to]);
        }
        owned
            .get_or_insert_with(|| Vec::with_capacity(end - start))
            .extend_from_slice(&seg[from..to]);
    }
    Cow::Owned(owned.unwrap_or_default())
}

/// Write header, remaining length and body into `out`.
pub fn write_frame(header: u8, body: &[u8], out: &mut BufferWriter) -> Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_REMAINING_LENGTH)
        .ok_or_else(|| Error::protocol(format!("frame body of {} bytes is too large", body.len())))?;

    write_u8(out, header);
    encode_variable_int(len, out)?;
    for chunk in body.chunks(WRITE_CHUNK) {
        out.claim(chunk.len())[..chunk.len()].copy_from_slice(chunk);
        out.commit(chunk.len());
    }
    Ok(())
}

/// Incremental frame reader over an async byte stream.
///
/// Frames returned by [`FrameReader::next_frame`] borrow the reader's
/// buffer. Their bytes are retired on the next call (or on
/// [`FrameReader::retire`]), so a frame stays valid for exactly one read
/// cycle.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_packet_size: usize,
    pending: usize,
}

impl FrameReader {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
            pending: 0,
        }
    }

    /// Bytes received but not yet retired.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop the bytes of the last returned frame.
    pub fn retire(&mut self) {
        if self.pending > 0 {
            self.buf.advance(self.pending);
            self.pending = 0;
        }
    }

    /// Locate a complete frame at the head of the buffer.
    fn complete(&self) -> Result<Option<(usize, usize)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let Some((len, len_bytes)) = decode_variable_int(&self.buf[1..])? else {
            return Ok(None);
        };
        let start = 1 + len_bytes;
        let end = start + len as usize;
        if end > self.max_packet_size {
            return Err(Error::protocol(format!(
                "packet of {} bytes exceeds maximum {}",
                end, self.max_packet_size
            )));
        }
        if self.buf.len() < end {
            return Ok(None);
        }
        Ok(Some((start, end)))
    }

    /// Read until a whole frame is buffered and return it.
    ///
    /// End of stream is [`Error::ConnectionClosed`]. Cancelling the future
    /// loses no data.
    pub async fn next_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Frame<'_>> {
        self.retire();
        loop {
            if let Some((start, end)) = self.complete()? {
                self.pending = end;
                return Ok(Frame::new(self.buf[0], &self.buf[start..end]));
            }

            let mut tmp = [0u8; 4096];
            let n = reader.read(&mut tmp).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}
