/// Contiguous byte buffer with independent write and read indices.
///
/// Bytes are appended at the write index and consumed from the read index;
/// neither index wraps. `to_write` reports the free tail after the write
/// index, so a buffer can run out of writable space while still holding
/// consumed bytes at the front; `compact` reclaims that space by sliding
/// the unread span to offset zero. Capacity is fixed after construction.
pub struct LinearBuffer {
    data: Vec<u8>,
    wrix: usize,
    rdix: usize,
}

impl LinearBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            wrix: 0,
            rdix: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes free to be written (tail space after the write index).
    pub fn to_write(&self) -> usize {
        self.data.len() - self.wrix
    }

    /// Number of bytes available to be read.
    pub fn to_read(&self) -> usize {
        self.wrix - self.rdix
    }

    pub fn is_empty(&self) -> bool {
        self.to_read() == 0
    }

    /// Unread span, for direct consumption by a write syscall.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.rdix..self.wrix]
    }

    /// Free tail span, for direct filling by a read syscall; pair with
    /// `forward` to commit the bytes actually read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let wrix = self.wrix;
        &mut self.data[wrix..]
    }

    /// Appends bytes, capped at the free tail space. Returns bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.to_write().min(buf.len());
        if n > 0 {
            self.data[self.wrix..self.wrix + n].copy_from_slice(&buf[..n]);
            self.wrix += n;
        }
        n
    }

    /// Copies and consumes bytes, capped at the unread span. Returns bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.peek(buf);
        self.rdix += n;
        n
    }

    /// Like `read` but does not consume.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let n = self.to_read().min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&self.data[self.rdix..self.rdix + n]);
        }
        n
    }

    /// Consumes without copying. Returns bytes skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = self.to_read().min(n);
        self.rdix += n;
        n
    }

    /// Advances the write index without writing, committing bytes placed in
    /// `spare_mut` by a syscall. Returns bytes advanced.
    pub fn forward(&mut self, n: usize) -> usize {
        let n = self.to_write().min(n);
        self.wrix += n;
        n
    }

    /// Slides the unread span to offset zero.
    pub fn compact(&mut self) {
        if self.rdix == 0 {
            return;
        }
        let pending = self.wrix - self.rdix;
        if pending == 0 {
            self.wrix = 0;
            self.rdix = 0;
            return;
        }
        self.data.copy_within(self.rdix..self.wrix, 0);
        self.rdix = 0;
        self.wrix = pending;
    }

    /// Drops all content.
    pub fn clear(&mut self) {
        self.wrix = 0;
        self.rdix = 0;
    }
}

impl Default for LinearBuffer {
    fn default() -> Self {
        Self::new()
    }
}
