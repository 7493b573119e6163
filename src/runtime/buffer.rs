//! Fixed-capacity per-connection buffers.
//!
//! Each connection owns one read buffer and one write buffer, allocated once
//! on accept and sized to hold a single maximal frame. Nothing grows on the
//! hot path; a connection that never completes a frame is bounded by these
//! sizes.

/// Inbound bytes, valid data always starts at offset 0.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    /// Valid bytes currently held (`read_size`).
    len: usize,
}

impl ReadBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Valid bytes currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffered bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The unused tail, for the next read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` bytes of the tail as filled.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.data.len(), "advance past capacity");
        self.len = (self.len + n).min(self.data.len());
    }

    /// Drop `n` bytes from the front, shifting the remainder down.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        if n < self.len {
            self.data.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }
}

/// Outbound bytes with a send cursor.
///
/// `sent <= len <= capacity` always holds.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Box<[u8]>,
    /// Total bytes queued (`write_size`).
    len: usize,
    /// Bytes already transmitted (`write_sent`).
    sent: usize,
}

impl WriteBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            sent: 0,
        }
    }

    /// Total bytes queued.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes already transmitted.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Whole buffer, for encoding a reply in place. Follow with [`set_len`].
    ///
    /// [`set_len`]: WriteBuffer::set_len
    pub fn reply_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Queue the first `len` bytes for sending and rewind the cursor.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len(), "reply exceeds write capacity");
        self.len = len.min(self.data.len());
        self.sent = 0;
    }

    /// Bytes still waiting to be sent.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.sent..self.len]
    }

    /// Record `n` bytes as transmitted.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.len, "advance past queued bytes");
        self.sent = (self.sent + n).min(self.len);
    }

    /// All queued bytes have been sent.
    pub fn is_drained(&self) -> bool {
        self.sent == self.len
    }

    /// Reset both offsets to zero.
    pub fn clear(&mut self) {
        self.len = 0;
        self.sent = 0;
    }
}
