//! Fixed-capacity ring buffer for byte storage.
//!
//! The same buffer type backs both outbound message batching (see
//! [`MessageBuffer`](crate::protocol::MessageBuffer)) and each stream's
//! inbound byte queue. Storage is allocated once and never grows.
//!
//! Data occupies at most two contiguous segments of storage:
//!
//! ```text
//! [FREE|DATA|FREE]   start > 0, no wrap
//! [DATA|FREE|DATA]   data wraps around the end of storage
//! ```
//!
//! Whenever the buffer drains completely the start index is reset to 0, so an
//! empty buffer always presents a single contiguous free segment.
//!
//! None of the operations are synchronised; callers serialise access.

use std::io::{self, Read, Write};

use bytes::Buf;
use thiserror::Error;

/// Error returned by ring buffer transfers.
///
/// Every variant records how many bytes were transferred before the failure,
/// since those bytes are already committed to (or removed from) the buffer.
#[derive(Debug, Error)]
pub enum RingError {
    /// Storage ran out before the requested transfer completed.
    #[error("buffer full")]
    Full {
        /// Bytes transferred before storage ran out.
        transferred: usize,
    },

    /// The source or sink failed (including a source that ended early).
    #[error("ring buffer transfer failed: {source}")]
    Io {
        /// Bytes transferred before the failure.
        transferred: usize,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },
}

impl RingError {
    /// Bytes transferred before the failure.
    pub fn transferred(&self) -> usize {
        match self {
            RingError::Full { transferred } | RingError::Io { transferred, .. } => *transferred,
        }
    }

    /// Whether the failure was caused by exhausted storage.
    pub fn is_full(&self) -> bool {
        matches!(self, RingError::Full { .. })
    }
}

/// A fixed-size circular byte buffer.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Start of data, always in `[0, size)` (or 0 for a zero-sized buffer).
    start: usize,
    /// Number of stored bytes, always in `[0, size]`.
    used: usize,
}

impl RingBuffer {
    /// Create a ring buffer with the given capacity.
    pub fn new(size: usize) -> Self {
        Self {
            storage: vec![0u8; size].into_boxed_slice(),
            start: 0,
            used: 0,
        }
    }

    /// Total capacity.
    #[inline]
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes currently stored.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Remaining capacity.
    #[inline]
    pub fn free(&self) -> usize {
        self.size() - self.used
    }

    /// Whether no bytes are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Discard all stored data without touching the backing storage.
    pub fn reset(&mut self) {
        self.start = 0;
        self.used = 0;
    }

    /// First contiguous free segment.
    fn free_segment(&mut self) -> &mut [u8] {
        let size = self.size();
        let free_start = (self.start + self.used) % size;
        let free_end = (free_start + (size - self.used)).min(size);
        &mut self.storage[free_start..free_end]
    }

    /// First contiguous data segment.
    fn data_segment(&self) -> &[u8] {
        let end = (self.start + self.used).min(self.size());
        &self.storage[self.start..end]
    }

    fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.used);
        self.used -= count;
        if self.used == 0 {
            self.start = 0;
        } else {
            self.start = (self.start + count) % self.size();
        }
    }

    /// Copy as much of `data` as fits.
    ///
    /// Returns [`RingError::Full`] only if some of `data` could not be stored;
    /// the bytes that did fit remain in the buffer and are reported through
    /// [`RingError::transferred`].
    pub fn write(&mut self, mut data: &[u8]) -> Result<usize, RingError> {
        let mut written = 0;
        while !data.is_empty() && self.used != self.size() {
            let free = self.free_segment();
            let copied = free.len().min(data.len());
            free[..copied].copy_from_slice(&data[..copied]);
            data = &data[copied..];
            self.used += copied;
            written += copied;
        }

        if !data.is_empty() {
            return Err(RingError::Full {
                transferred: written,
            });
        }
        Ok(written)
    }

    /// Store a single byte.
    pub fn write_byte(&mut self, value: u8) -> Result<(), RingError> {
        if self.used == self.size() {
            return Err(RingError::Full { transferred: 0 });
        }
        let index = (self.start + self.used) % self.size();
        self.storage[index] = value;
        self.used += 1;
        Ok(())
    }

    /// Read exactly `n` bytes from `reader` into the buffer.
    ///
    /// Unlike `io::copy`, this never asks the reader for more than `n` bytes,
    /// so a source that ends right at `n` bytes succeeds. The failure modes are
    /// kept distinct:
    /// - storage exhausted before `n` bytes: [`RingError::Full`]
    /// - source ended before `n` bytes: [`RingError::Io`] with
    ///   [`io::ErrorKind::UnexpectedEof`]
    /// - source failed: [`RingError::Io`]
    pub fn read_n_from<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        mut n: usize,
    ) -> Result<usize, RingError> {
        let mut read = 0;
        while n > 0 && self.used != self.size() {
            let free = self.free_segment();
            let limit = free.len().min(n);
            match reader.read(&mut free[..limit]) {
                Ok(0) => {
                    return Err(RingError::Io {
                        transferred: read,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "source ended before requested length",
                        ),
                    });
                }
                Ok(count) => {
                    self.used += count;
                    read += count;
                    n -= count;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RingError::Io {
                        transferred: read,
                        source: e,
                    });
                }
            }
        }

        if n > 0 {
            return Err(RingError::Full { transferred: read });
        }
        Ok(read)
    }

    /// Move stored bytes into `buffer`, returning how many were copied.
    ///
    /// A return of 0 for a non-empty `buffer` means the ring is empty.
    pub fn read(&mut self, mut buffer: &mut [u8]) -> usize {
        let mut result = 0;
        while !buffer.is_empty() && self.used > 0 {
            let data = self.data_segment();
            let copied = data.len().min(buffer.len());
            buffer[..copied].copy_from_slice(&data[..copied]);
            buffer = &mut buffer[copied..];
            self.consume(copied);
            result += copied;
        }
        result
    }

    /// Remove and return the oldest byte.
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.used == 0 {
            return None;
        }
        let value = self.storage[self.start];
        self.consume(1);
        Some(value)
    }

    /// Drain the buffer into `writer`.
    pub fn write_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> Result<usize, RingError> {
        let mut written = 0;
        while self.used > 0 {
            match writer.write(self.data_segment()) {
                Ok(0) => {
                    return Err(RingError::Io {
                        transferred: written,
                        source: io::Error::new(io::ErrorKind::WriteZero, "sink accepted no data"),
                    });
                }
                Ok(count) => {
                    self.consume(count);
                    written += count;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RingError::Io {
                        transferred: written,
                        source: e,
                    });
                }
            }
        }
        Ok(written)
    }
}

impl Read for RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(RingBuffer::read(self, buf))
    }
}

impl Write for RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match RingBuffer::write(self, buf) {
            Ok(count) => Ok(count),
            Err(err) if err.transferred() > 0 => Ok(err.transferred()),
            Err(err) => Err(io::Error::new(io::ErrorKind::WriteZero, err)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Buf for RingBuffer {
    fn remaining(&self) -> usize {
        self.used
    }

    fn chunk(&self) -> &[u8] {
        self.data_segment()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.used, "advance past end of ring buffer");
        self.consume(cnt);
    }
}
