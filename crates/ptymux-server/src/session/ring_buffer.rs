//! Circular scrollback buffer for replaying output on session switch.
//!
//! Stores the last N bytes of PTY output so that a newly subscribed client
//! receives a history snapshot without the server keeping unbounded history.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    buf: Vec<u8>,
    /// Index of the oldest retained byte.
    start: usize,
    /// Number of valid bytes (never above capacity).
    len: usize,
    /// Total bytes ever appended.
    total_appended: u64,
}

impl ScrollbackBuffer {
    /// Create a new buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            start: 0,
            len: 0,
            total_appended: 0,
        }
    }

    /// Append output, discarding the oldest bytes once full.
    pub fn append(&mut self, data: &[u8]) {
        let capacity = self.buf.len();
        self.total_appended += data.len() as u64;
        if capacity == 0 || data.is_empty() {
            return;
        }

        if data.len() >= capacity {
            self.buf.copy_from_slice(&data[data.len() - capacity..]);
            self.start = 0;
            self.len = capacity;
            return;
        }

        let end = (self.start + self.len) % capacity;
        let free = capacity - self.len;
        if data.len() > free {
            let overflow = data.len() - free;
            self.start = (self.start + overflow) % capacity;
            self.len = capacity;
        } else {
            self.len += data.len();
        }

        // At most two copies: up to the end of the array, then from 0.
        let first = data.len().min(capacity - end);
        self.buf[end..end + first].copy_from_slice(&data[..first]);
        let second = data.len() - first;
        if second > 0 {
            self.buf[..second].copy_from_slice(&data[first..]);
        }
    }

    /// Copy out the retained bytes, oldest first.
    pub fn to_snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        let capacity = self.buf.len();
        let tail = (capacity - self.start).min(self.len);
        out.extend_from_slice(&self.buf[self.start..self.start + tail]);
        out.extend_from_slice(&self.buf[..self.len - tail]);
        out
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes ever appended, including discarded ones.
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}
