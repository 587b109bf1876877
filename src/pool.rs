//! Outbound message buffer pool.
//!
//! The pool is the multiplexer's backpressure mechanism: every outbound
//! message (stream data, open/accept, batched control updates) must first
//! take a [`MessageBuffer`] from the pool, and buffers only come back once the
//! writer task has flushed them to the carrier. When the carrier is slower
//! than the producers, producers block in [`BufferPool::acquire`] instead of
//! queueing unbounded data.
//!
//! # Design
//!
//! - A semaphore counts free buffers; its permits always equal the free list
//!   length outside of `acquire`/`release`
//! - Buffers are reset on return, keeping their backing storage
//! - Closing the pool wakes every waiter with [`Error::MultiplexerClosed`]

use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::protocol::MessageBuffer;
use crate::sync::lock;

/// Fixed-size pool of reusable outbound buffers.
#[derive(Debug)]
pub(crate) struct BufferPool {
    available: Semaphore,
    buffers: Mutex<Vec<MessageBuffer>>,
}

impl BufferPool {
    /// Create a pool holding `capacity` empty buffers.
    pub(crate) fn new(capacity: usize) -> Self {
        let buffers = (0..capacity).map(|_| MessageBuffer::new()).collect();
        Self {
            available: Semaphore::new(capacity),
            buffers: Mutex::new(buffers),
        }
    }

    /// Number of buffers currently free.
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.available.available_permits()
    }

    fn take(&self) -> MessageBuffer {
        let mut buffers = lock(&self.buffers);
        // A held permit guarantees a buffer; the fallback is never expected.
        buffers.pop().unwrap_or_default()
    }

    /// Take a buffer, waiting while the pool is exhausted.
    ///
    /// Cancel safe: dropping the future before it completes takes nothing.
    pub(crate) async fn acquire(&self) -> Result<MessageBuffer> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| Error::MultiplexerClosed)?;
        permit.forget();
        Ok(self.take())
    }

    /// Take a buffer only if one is free right now.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<MessageBuffer> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        Some(self.take())
    }

    /// Return a buffer to the pool.
    pub(crate) fn release(&self, mut buffer: MessageBuffer) {
        buffer.reset();
        lock(&self.buffers).push(buffer);
        self.available.add_permits(1);
    }

    /// Fail all current and future acquisitions.
    pub(crate) fn close(&self) {
        self.available.close();
    }
}
