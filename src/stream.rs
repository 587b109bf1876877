//! Multiplexed streams.
//!
//! A [`Stream`] is one bidirectional, flow-controlled byte channel carried by
//! a [`Multiplexer`](crate::Multiplexer). Reads and writes are independent:
//! one read and one write may run concurrently, further callers of the same
//! direction queue behind a per-direction token.
//!
//! # Lifecycle
//!
//! ```text
//!            open/accept                close_write             close
//! (pending) ────────────► established ────────────► half-closed ──────► closed
//!                                       remote CloseWrite → reads see EOF
//!                                       remote Close      → writes fail
//! ```
//!
//! Dropping a [`Stream`] closes it as if [`Stream::close`] had been called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify, OnceCell, Semaphore};
use tokio::time::Instant;

use crate::address::StreamAddress;
use crate::aggregator::ControlUpdate;
use crate::error::{Error, Result};
use crate::multiplexer::Shared;
use crate::protocol::MAX_DATA_BLOCK_SIZE;
use crate::ring::RingBuffer;
use crate::sync::{lock, Signal};

type Deadline = Option<Instant>;

/// Stream state shared between the handle and the multiplexer's tasks.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) id: u64,

    /// Remote accepted (outbound) or we accepted (inbound).
    pub(crate) established: Signal,
    pub(crate) remote_closed_write: Signal,
    pub(crate) remote_closed: Signal,
    pub(crate) closed_write: Signal,
    pub(crate) closed: Signal,

    read_token: Semaphore,
    write_token: Semaphore,
    read_deadline: watch::Sender<Deadline>,
    write_deadline: watch::Sender<Deadline>,
    write_closure: OnceCell<()>,
    closure: OnceCell<()>,

    receive: Mutex<RingBuffer>,
    receive_ready: Notify,
    send_window: Mutex<u64>,
    send_window_ready: Notify,
}

impl StreamState {
    pub(crate) fn new(id: u64, receive_window: usize) -> Self {
        Self {
            id,
            established: Signal::new(),
            remote_closed_write: Signal::new(),
            remote_closed: Signal::new(),
            closed_write: Signal::new(),
            closed: Signal::new(),
            read_token: Semaphore::new(1),
            write_token: Semaphore::new(1),
            read_deadline: watch::Sender::new(None),
            write_deadline: watch::Sender::new(None),
            write_closure: OnceCell::new(),
            closure: OnceCell::new(),
            receive: Mutex::new(RingBuffer::new(receive_window)),
            receive_ready: Notify::new(),
            send_window: Mutex::new(0),
            send_window_ready: Notify::new(),
        }
    }

    /// Record the window the remote advertised in its open or accept message.
    pub(crate) fn set_send_window(&self, window: u64) {
        *lock(&self.send_window) = window;
        self.send_window_ready.notify_waiters();
    }

    /// Add remote-granted send credit.
    pub(crate) fn grant(&self, increment: u64) -> Result<()> {
        {
            let mut window = lock(&self.send_window);
            *window = window
                .checked_add(increment)
                .ok_or_else(|| Error::protocol("window increment overflows maximum value"))?;
        }
        self.send_window_ready.notify_waiters();
        Ok(())
    }

    /// Store inbound data in the receive buffer.
    pub(crate) fn deliver(&self, mut data: &[u8]) -> Result<()> {
        let length = data.len();
        {
            let mut receive = lock(&self.receive);
            receive.read_n_from(&mut data, length).map_err(|err| {
                if err.is_full() {
                    Error::protocol("remote violated stream receive window")
                } else {
                    Error::protocol(format!("unable to buffer inbound data: {err}"))
                }
            })?;
        }
        self.receive_ready.notify_waiters();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn send_window(&self) -> u64 {
        *lock(&self.send_window)
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        lock(&self.receive).used()
    }
}

/// A multiplexed stream.
///
/// All methods take `&self`; wrap the stream in an [`Arc`] to read and write
/// from different tasks, or use [`StreamIo`](crate::StreamIo) for the
/// `tokio::io` traits.
#[derive(Debug)]
pub struct Stream {
    state: Arc<StreamState>,
    shared: Arc<Shared>,
    /// The remote knows this stream exists, so closing it must be announced.
    announced: AtomicBool,
}

impl Stream {
    pub(crate) fn new(state: Arc<StreamState>, shared: Arc<Shared>, announced: bool) -> Self {
        Self {
            state,
            shared,
            announced: AtomicBool::new(announced),
        }
    }

    pub(crate) fn state(&self) -> &StreamState {
        &self.state
    }

    pub(crate) fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Stream identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Local address of the stream.
    pub fn local_addr(&self) -> StreamAddress {
        StreamAddress::local(self.state.id)
    }

    /// Remote address of the stream.
    pub fn remote_addr(&self) -> StreamAddress {
        StreamAddress::remote(self.state.id)
    }

    /// Whether [`Stream::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.closed.is_fired()
    }

    /// Read buffered inbound data into `buf`.
    ///
    /// Waits until data is available. Returns `Ok(0)` at end of stream, i.e.
    /// once the buffer is drained and the remote has closed its write side
    /// (or the whole stream). Consumed bytes are granted back to the remote
    /// as window.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the stream was closed locally
    /// - [`Error::MultiplexerClosed`] if the multiplexer shut down
    /// - [`Error::Timeout`] if the read deadline passed
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let state = &*self.state;
        self.check_readable()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let _token = tokio::select! {
            token = state.read_token.acquire() => token.map_err(|_| Error::Closed)?,
            _ = state.closed.fired() => return Err(Error::Closed),
            _ = self.shared.closed.fired() => return Err(Error::MultiplexerClosed),
        };

        let mut deadline = state.read_deadline.subscribe();
        loop {
            self.check_readable()?;
            let current = *deadline.borrow_and_update();
            if expired(current) {
                return Err(Error::Timeout);
            }

            let ready = state.receive_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let has_data = !lock(&state.receive).is_empty();
            if has_data {
                break;
            }
            if state.remote_closed_write.is_fired() || state.remote_closed.is_fired() {
                return Ok(0);
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = state.remote_closed_write.fired() => {}
                _ = state.remote_closed.fired() => {}
                _ = state.closed.fired() => {}
                _ = self.shared.closed.fired() => {}
                _ = sleep_until(current) => {}
                _ = deadline.changed() => {}
            }
        }

        let count = lock(&state.receive).read(buf);
        if count > 0 {
            // Failure means the multiplexer is closing; the data is still ours.
            let _ = self.shared.enqueue(ControlUpdate::WindowIncrement {
                stream: state.id,
                amount: count as u64,
            });
        }
        Ok(count)
    }

    /// Write `data` to the stream, splitting it across as many data messages
    /// as the remote's window and the maximum block size require.
    ///
    /// Returns the number of bytes handed to the carrier. If an error
    /// interrupts a partially completed write, the partial count is returned
    /// and the error surfaces on the next call.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] / [`Error::WriteClosed`] after a local close
    /// - [`Error::RemoteClosed`] after the remote closed the stream
    /// - [`Error::MultiplexerClosed`] if the multiplexer shut down
    /// - [`Error::Timeout`] if the write deadline passed
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        match self.write_chunks(data, &mut written).await {
            Ok(()) => Ok(written),
            Err(_) if written > 0 => Ok(written),
            Err(err) => Err(err),
        }
    }

    /// Write all of `data`.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let written = self.write(data).await?;
            data = &data[written..];
        }
        Ok(())
    }

    async fn write_chunks(&self, mut data: &[u8], written: &mut usize) -> Result<()> {
        let state = &*self.state;
        self.check_writable()?;
        if data.is_empty() {
            return Ok(());
        }

        let _token = tokio::select! {
            token = state.write_token.acquire() => token.map_err(|_| Error::WriteClosed)?,
            _ = state.closed.fired() => return Err(Error::Closed),
            _ = state.closed_write.fired() => return Err(Error::WriteClosed),
            _ = self.shared.closed.fired() => return Err(Error::MultiplexerClosed),
            _ = state.remote_closed.fired() => return Err(Error::RemoteClosed),
        };

        let mut deadline = state.write_deadline.subscribe();
        while !data.is_empty() {
            let mut buffer = loop {
                self.check_writable()?;
                let current = *deadline.borrow_and_update();
                if expired(current) {
                    return Err(Error::Timeout);
                }

                let window_ready = state.send_window_ready.notified();
                tokio::pin!(window_ready);
                window_ready.as_mut().enable();
                let has_window = *lock(&state.send_window) > 0;

                tokio::select! {
                    buffer = self.shared.pool.acquire(), if has_window => break buffer?,
                    _ = &mut window_ready, if !has_window => {}
                    _ = state.closed.fired() => {}
                    _ = state.closed_write.fired() => {}
                    _ = state.remote_closed.fired() => {}
                    _ = self.shared.closed.fired() => {}
                    _ = sleep_until(current) => {}
                    _ = deadline.changed() => {}
                }
            };

            // Only this token holder spends window, so it cannot have shrunk.
            let chunk = {
                let mut window = lock(&state.send_window);
                let chunk = (*window)
                    .min(data.len() as u64)
                    .min(MAX_DATA_BLOCK_SIZE as u64) as usize;
                *window -= chunk as u64;
                chunk
            };

            buffer.encode_data(state.id, &data[..chunk]);
            self.shared.submit(buffer)?;
            data = &data[chunk..];
            *written += chunk;
        }
        Ok(())
    }

    /// Close the write side. The remote reads end of stream once it has
    /// drained everything written before this call.
    ///
    /// Waits for an in-progress write to finish. Idempotent.
    pub async fn close_write(&self) -> Result<()> {
        self.shut_write(true).await
    }

    async fn shut_write(&self, announce: bool) -> Result<()> {
        let mut outcome = Ok(());
        let result = &mut outcome;
        self.state
            .write_closure
            .get_or_init(|| async move {
                self.state.closed_write.fire();
                retire(&self.state.write_token).await;
                if announce {
                    *result = self.shared.enqueue(ControlUpdate::CloseWrite(self.state.id));
                }
            })
            .await;
        outcome
    }

    /// Close the stream in both directions.
    ///
    /// Waits for in-progress reads and writes to observe the closure, then
    /// tells the remote (unless it never learned of the stream) and releases
    /// the stream identifier's slot. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shut_write(false).await;

        let mut outcome = Ok(());
        let result = &mut outcome;
        self.state
            .closure
            .get_or_init(|| async move {
                self.state.closed.fire();
                retire(&self.state.read_token).await;
                *result = self.finish_close();
            })
            .await;
        outcome
    }

    fn finish_close(&self) -> Result<()> {
        let result = if self.is_announced() {
            self.shared.enqueue(ControlUpdate::Close(self.state.id))
        } else {
            Ok(())
        };
        self.shared.deregister(self.state.id);
        tracing::debug!(stream = self.state.id, "stream closed");
        result
    }

    /// Set the read deadline. `None` clears it; a past instant makes pending
    /// and future reads fail with [`Error::Timeout`].
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.state.closed.is_fired() {
            return Err(Error::Closed);
        }
        self.state.read_deadline.send_replace(deadline);
        Ok(())
    }

    /// Set the write deadline. Same semantics as [`Stream::set_read_deadline`].
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.state.closed_write.is_fired() {
            return Err(Error::WriteClosed);
        }
        self.state.write_deadline.send_replace(deadline);
        Ok(())
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    fn check_readable(&self) -> Result<()> {
        if self.state.closed.is_fired() {
            Err(Error::Closed)
        } else if self.shared.closed.is_fired() {
            Err(Error::MultiplexerClosed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.state.closed.is_fired() {
            Err(Error::Closed)
        } else if self.state.closed_write.is_fired() {
            Err(Error::WriteClosed)
        } else if self.shared.closed.is_fired() {
            Err(Error::MultiplexerClosed)
        } else if self.state.remote_closed.is_fired() {
            Err(Error::RemoteClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state.closure.initialized() {
            return;
        }
        // `&mut self` means no read or write is in flight on this handle.
        self.state.closed_write.fire();
        self.state.write_token.close();
        let _ = self.state.write_closure.set(());
        self.state.closed.fire();
        self.state.read_token.close();
        if self.state.closure.set(()).is_ok() {
            let _ = self.finish_close();
        }
    }
}

/// Wait for the holder of a direction's token to finish, then make the token
/// permanently unavailable.
async fn retire(token: &Semaphore) {
    if let Ok(permit) = token.acquire().await {
        permit.forget();
    }
    token.close();
}

fn expired(deadline: Deadline) -> bool {
    matches!(deadline, Some(at) if at <= Instant::now())
}

async fn sleep_until(deadline: Deadline) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
