//! Fixed-capacity circular byte buffer for captured process output.
//!
//! Holds at most the most recent `capacity` bytes written. Writes never fail,
//! never block on readers beyond a short lock, and never grow the buffer.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe ring buffer that overwrites its oldest bytes when full.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    data: Box<[u8]>,
    /// Index of the oldest byte.
    start: usize,
    /// Number of bytes held.
    len: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    ///
    /// A zero-capacity buffer accepts writes and retains nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                data: vec![0; capacity].into_boxed_slice(),
                start: 0,
                len: 0,
            }),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        // A panic mid-write cannot leave the indices out of range, so the
        // data is still usable after poisoning.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes, dropping the oldest ones once full. Returns `bytes.len()`.
    pub fn write(&self, bytes: &[u8]) -> usize {
        self.ring().push(bytes);
        bytes.len()
    }

    /// Held bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.ring().contents()
    }

    /// Held bytes as text, oldest first.
    ///
    /// Wrapping can cut a multi-byte character in half; such fragments are
    /// replaced with U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    /// Number of bytes held, never more than the capacity.
    pub fn len(&self) -> usize {
        self.ring().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring().data.len()
    }

    /// Drop all held bytes.
    pub fn clear(&self) {
        let mut ring = self.ring();
        ring.start = 0;
        ring.len = 0;
    }
}

impl Ring {
    fn push(&mut self, mut bytes: &[u8]) {
        let cap = self.data.len();
        if cap == 0 {
            return;
        }
        if bytes.len() >= cap {
            // Only the tail can survive.
            bytes = &bytes[bytes.len() - cap..];
            self.data.copy_from_slice(bytes);
            self.start = 0;
            self.len = cap;
            return;
        }

        let end = (self.start + self.len) % cap;
        let first = bytes.len().min(cap - end);
        self.data[end..end + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);

        let total = self.len + bytes.len();
        if total > cap {
            self.start = (self.start + total - cap) % cap;
            self.len = cap;
        } else {
            self.len = total;
        }
    }

    fn contents(&self) -> Vec<u8> {
        let cap = self.data.len();
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        let first = self.len.min(cap - self.start);
        out.extend_from_slice(&self.data[self.start..self.start + first]);
        out.extend_from_slice(&self.data[..self.len - first]);
        out
    }
}

impl std::io::Write for &RingBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(RingBuffer::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
