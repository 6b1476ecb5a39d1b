//! Growable output buffer with a claim/commit interface.
//!
//! ```
//! use giztoy_mqtt3::protocol::BufferWriter;
//!
//! let mut out = BufferWriter::new();
//! let span = out.claim(3);
//! span[..3].copy_from_slice(&[0xC0, 0x00, 0x01]);
//! out.commit(2);
//! assert_eq!(out.written(), &[0xC0, 0x00]);
//! ```
//!
//! The writer is not synchronized. Sessions keep theirs behind the same
//! lock that guards the socket write half.

use bytes::BytesMut;

/// Smallest allocation the writer makes.
pub const MIN_CAPACITY: usize = 1024;

/// Buffers larger than this are released on [`BufferWriter::reset`].
pub const RETAIN_CAPACITY: usize = 1024;

/// Growable byte buffer used to assemble outgoing frames.
#[derive(Debug, Default)]
pub struct BufferWriter {
    // `buf[..written]` is committed. The rest of `buf` is initialized
    // scratch space handed out by `claim`, kept across resets so a reused
    // writer never fills it again.
    buf: BytesMut,
    written: usize,
}

impl BufferWriter {
    /// Create an empty writer. Nothing is allocated until the first claim.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a writable span of at least `min_size` bytes after the
    /// committed data, growing the storage if needed.
    pub fn claim(&mut self, min_size: usize) -> &mut [u8] {
        if self.buf.len() - self.written < min_size {
            self.grow(min_size);
        }
        &mut self.buf[self.written..]
    }

    fn grow(&mut self, min_size: usize) {
        let needed = self.written + min_size;
        let size = needed.max(self.buf.len() * 2).max(MIN_CAPACITY);
        // `BytesMut` carries the committed prefix over when it reallocates.
        self.buf.resize(size, 0);
    }

    /// Mark `n` bytes of the last claimed span as written.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the free space, which means the caller wrote
    /// past what it claimed.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.buf.len() - self.written,
            "commit of {} bytes exceeds claimed span of {}",
            n,
            self.buf.len() - self.written
        );
        self.written += n;
    }

    /// Claim, copy and commit in one step.
    pub fn put_slice(&mut self, data: &[u8]) {
        self.claim(data.len())[..data.len()].copy_from_slice(data);
        self.commit(data.len());
    }

    /// Everything committed since the last reset.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.written]
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Current usable size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything committed after the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.written = self.written.min(len);
    }

    /// Overwrite the reserved bytes `at..body` with `prefix` and move the
    /// committed bytes after `body` down to follow it.
    ///
    /// Used to fill in a length field sized for the worst case once the
    /// real length is known.
    ///
    /// # Panics
    ///
    /// Panics if `prefix` does not fit in the reserved range or the range
    /// is not committed.
    pub(crate) fn fill_reserved(&mut self, at: usize, body: usize, prefix: &[u8]) {
        let end = at + prefix.len();
        assert!(
            end <= body && body <= self.written,
            "prefix of {} bytes does not fit reserved range {}..{}",
            prefix.len(),
            at,
            body
        );
        self.buf[at..end].copy_from_slice(prefix);
        self.buf.copy_within(body..self.written, end);
        self.written -= body - end;
    }

    /// Drop the committed data. Small allocations are kept for reuse,
    /// larger ones go back to the allocator.
    pub fn reset(&mut self) {
        self.written = 0;
        if self.buf.len() > RETAIN_CAPACITY {
            self.buf = BytesMut::new();
        }
    }
}
