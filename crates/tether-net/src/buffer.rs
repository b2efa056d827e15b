//! Read and write buffers used by every connection.
//!
//! [`ReadBuffer`] is a growable byte region with a consumption cursor: bytes
//! the delegate does not consume stay put, contiguous, and are handed back on
//! the next delivery. [`QueuedWriteBuffer`] is a FIFO of byte chunks that can
//! be appended to while a write from its head is still in flight.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{NetworkError, Result};

/// A growable read buffer with a consumed-offset cursor.
///
/// Layout: `[consumed | unconsumed data | spare]`.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    max: usize,
}

impl ReadBuffer {
    /// Create a buffer with `initial` bytes of capacity that may grow to `max`.
    pub fn new(initial: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            buf: vec![0; initial.clamp(1, max)],
            start: 0,
            end: 0,
            max,
        }
    }

    /// Unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Current allocated capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Maximum capacity the buffer may grow to.
    pub fn max_capacity(&self) -> usize {
        self.max
    }

    /// Make room for at least one more byte.
    ///
    /// Compacts unconsumed data to the front first and grows (doubling, capped
    /// at the maximum) only if that is not enough. Returns `false` when the
    /// buffer is full of unconsumed data and already at its maximum.
    pub fn ensure_writable(&mut self) -> bool {
        if self.end < self.buf.len() {
            return true;
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
            return true;
        }
        if self.buf.len() >= self.max {
            return false;
        }
        let grown = self.buf.len().saturating_mul(2).min(self.max);
        self.buf.resize(grown, 0);
        true
    }

    /// Writable tail of the buffer.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    /// Record that `n` bytes were written into [`spare_mut`](Self::spare_mut).
    pub fn did_read(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end = (self.end + n).min(self.buf.len());
    }

    /// Drop `n` bytes from the front of the unconsumed data.
    pub fn did_consume(&mut self, n: usize) -> Result<()> {
        let available = self.len();
        if n > available {
            tracing::error!(target: "tether_net::connection", consumed = n, available, "delegate consumed more than it was given");
            return Err(NetworkError::InvalidConsume {
                consumed: n,
                available,
            });
        }
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        Ok(())
    }

    /// Hand the unconsumed bytes to `consume` and advance by what it reports.
    ///
    /// Returns the number of bytes consumed. A report larger than what was
    /// handed over is rejected and leaves the buffer untouched.
    pub fn deliver(&mut self, consume: impl FnOnce(&[u8]) -> usize) -> Result<usize> {
        let consumed = consume(self.data());
        self.did_consume(consumed)?;
        Ok(consumed)
    }
}

/// A bounded FIFO of outbound byte chunks.
#[derive(Debug)]
pub struct QueuedWriteBuffer {
    queue: VecDeque<Bytes>,
    total: usize,
    max: usize,
}

impl QueuedWriteBuffer {
    /// Create an empty queue holding at most `max` bytes.
    pub fn new(max: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            total: 0,
            max,
        }
    }

    /// Append a chunk to the tail.
    ///
    /// Exceeding the maximum is reported, never truncated or dropped.
    pub fn append(&mut self, data: Bytes) -> Result<usize> {
        let len = data.len();
        if self.total.saturating_add(len) > self.max {
            return Err(NetworkError::WriteBufferFull {
                requested: len,
                pending: self.total,
                max: self.max,
            });
        }
        if len > 0 {
            self.total += len;
            self.queue.push_back(data);
        }
        Ok(len)
    }

    /// The chunk at the head, if any.
    pub fn front(&self) -> Option<Bytes> {
        self.queue.front().cloned()
    }

    /// Remove `n` written bytes from the head.
    pub fn did_consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.total -= front.len();
                self.queue.pop_front();
            } else {
                *front = front.slice(n..);
                self.total -= n;
                n = 0;
            }
        }
    }

    /// Total queued bytes.
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Maximum queued bytes.
    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything still queued.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.total = 0;
    }
}
