//! Stream multiplexer.
//!
//! A [`Multiplexer`] runs many independent [`Stream`]s over a single
//! [`Carrier`]. Each side allocates stream identifiers of one parity (even or
//! odd), so both sides may open streams without coordination.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐  inbound frames   ┌───────────────┐
//! Carrier read ──►│ reader task  │──────────────────►│ stream states │
//!                 └──────┬───────┘                   └──────┬────────┘
//!                        │ heartbeats                       │ reads/writes
//!                 ┌──────▼───────┐                   ┌──────▼────────┐
//!                 │  supervisor  │                   │ Stream handle │
//!                 └──────────────┘                   └──┬─────────┬──┘
//!                                       control updates │         │ data
//!                 ┌──────────────┐                ┌─────▼──────┐  │
//! Carrier write ◄─│ writer task  │◄───────────────│ aggregator │  │
//!                 └──────────────┘◄───────────────┴────────────┴──┘
//! ```
//!
//! The supervisor watches the reader and writer tasks and the heartbeat
//! timer. The first failure closes the multiplexer and is retained as the
//! [internal error](Multiplexer::internal_error).

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant};

use crate::address::MultiplexerAddress;
use crate::aggregator::{aggregator_loop, ControlUpdate};
use crate::carrier::Carrier;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::protocol::MessageBuffer;
use crate::reader::reader_loop;
use crate::stream::{Stream, StreamState};
use crate::sync::{lock, Signal};
use crate::writer::writer_loop;

/// Registered streams and outbound identifier allocation.
#[derive(Debug)]
struct StreamTable {
    /// Next outbound identifier; zero once the space is exhausted.
    next_outbound: u64,
    streams: HashMap<u64, Arc<StreamState>>,
}

/// State shared by the multiplexer handle, its streams and its tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) even: bool,
    pub(crate) config: Configuration,
    pub(crate) closed: Signal,
    pub(crate) pool: BufferPool,
    internal_error: Mutex<Option<Arc<Error>>>,
    table: Mutex<StreamTable>,
    pending: mpsc::UnboundedSender<MessageBuffer>,
    control: mpsc::UnboundedSender<ControlUpdate>,
    backlog: tokio::sync::Mutex<mpsc::Receiver<u64>>,
}

impl Shared {
    /// Whether `id` has the parity this side allocates.
    pub(crate) fn is_outbound(&self, id: u64) -> bool {
        (id % 2 == 0) == self.even
    }

    /// Find a registered stream. Fails if the remote references an outbound
    /// identifier that was never allocated.
    pub(crate) fn lookup(&self, id: u64, kind: u8) -> Result<Option<Arc<StreamState>>> {
        let table = lock(&self.table);
        if self.is_outbound(id) && table.next_outbound != 0 && id >= table.next_outbound {
            return Err(Error::protocol(format!(
                "message ({kind:#04x}) received for unused outbound stream identifier"
            )));
        }
        Ok(table.streams.get(&id).cloned())
    }

    pub(crate) fn register(&self, state: Arc<StreamState>) {
        lock(&self.table).streams.insert(state.id, state);
    }

    pub(crate) fn deregister(&self, id: u64) {
        lock(&self.table).streams.remove(&id);
    }

    fn allocate_outbound(&self) -> Result<Arc<StreamState>> {
        let mut table = lock(&self.table);
        let id = table.next_outbound;
        if id == 0 {
            return Err(Error::IdentifiersExhausted);
        }
        table.next_outbound = id.checked_add(2).unwrap_or(0);
        let state = Arc::new(StreamState::new(id, self.config.stream_receive_window));
        table.streams.insert(id, state.clone());
        Ok(state)
    }

    /// Queue a control message for the aggregator. Never blocks.
    pub(crate) fn enqueue(&self, update: ControlUpdate) -> Result<()> {
        if self.closed.is_fired() {
            return Err(Error::MultiplexerClosed);
        }
        self.control
            .send(update)
            .map_err(|_| Error::MultiplexerClosed)
    }

    /// Hand a filled buffer to the writer task.
    pub(crate) fn submit(&self, buffer: MessageBuffer) -> Result<()> {
        self.pending.send(buffer).map_err(|rejected| {
            self.pool.release(rejected.0);
            Error::MultiplexerClosed
        })
    }

    /// Close the multiplexer, recording `error` as the cause. Only the first
    /// call has any effect; returns whether this call closed it.
    pub(crate) fn close_with_error(&self, error: Option<Error>) -> bool {
        let mut internal = lock(&self.internal_error);
        if self.closed.is_fired() {
            return false;
        }
        match error {
            Some(error) => {
                tracing::warn!(error = %error, "multiplexer failed");
                *internal = Some(Arc::new(error));
            }
            None => tracing::debug!(even = self.even, "multiplexer closed"),
        }
        self.closed.fire();
        drop(internal);
        self.pool.close();
        true
    }
}

/// A stream multiplexer over a [`Carrier`].
///
/// Cheap to clone; clones share the same connection. The background tasks
/// run until [`Multiplexer::close`] is called, the carrier fails, or the
/// remote violates the protocol. Dropping the handles does not stop them.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Start a multiplexer over `carrier`.
    ///
    /// The two sides of a connection must pick opposite values of `even`.
    /// `None` selects [`Configuration::default`]; any configuration is
    /// normalised first.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<C: Carrier>(carrier: C, even: bool, configuration: Option<Configuration>) -> Self {
        let config = configuration.unwrap_or_default().normalized();

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (backlog_tx, backlog_rx) = mpsc::channel(config.accept_backlog);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            even,
            pool: BufferPool::new(config.write_buffer_count),
            config,
            closed: Signal::new(),
            internal_error: Mutex::new(None),
            table: Mutex::new(StreamTable {
                next_outbound: if even { 2 } else { 1 },
                streams: HashMap::new(),
            }),
            pending: pending_tx,
            control: control_tx,
            backlog: tokio::sync::Mutex::new(backlog_rx),
        });

        let (read_half, write_half) = tokio::io::split(carrier);
        let reader = tokio::spawn(reader_loop(
            shared.clone(),
            read_half,
            backlog_tx,
            heartbeat_tx,
        ));
        let writer = tokio::spawn(writer_loop(shared.clone(), write_half, pending_rx));
        let aggregator = tokio::spawn(aggregator_loop(shared.clone(), control_rx));
        tokio::spawn(supervise(
            shared.clone(),
            reader,
            writer,
            aggregator,
            heartbeat_rx,
        ));

        tracing::debug!(even, "multiplexer started");
        Self { shared }
    }

    /// Open a new outbound stream and wait for the remote to accept it.
    ///
    /// Dropping the returned future abandons the open; if the open message
    /// was already sent, the remote is told the stream is closed.
    ///
    /// # Errors
    ///
    /// - [`Error::Rejected`] if the remote refused the stream
    /// - [`Error::IdentifiersExhausted`] if no outbound identifiers remain
    /// - [`Error::MultiplexerClosed`] if the multiplexer shut down
    pub async fn open_stream(&self) -> Result<Stream> {
        let shared = &self.shared;
        if shared.closed.is_fired() {
            return Err(Error::MultiplexerClosed);
        }

        let stream = Stream::new(shared.allocate_outbound()?, shared.clone(), false);

        let mut buffer = tokio::select! {
            buffer = shared.pool.acquire() => buffer?,
            _ = shared.closed.fired() => return Err(Error::MultiplexerClosed),
        };
        buffer.encode_open(stream.id(), shared.config.stream_receive_window as u64);
        shared.submit(buffer)?;
        stream.mark_announced();

        let state = stream.state();
        tokio::select! {
            biased;
            _ = state.established.fired() => {
                tracing::debug!(stream = stream.id(), "outbound stream established");
                Ok(stream)
            }
            _ = state.remote_closed.fired() => {
                tracing::debug!(stream = stream.id(), "outbound stream rejected");
                Err(Error::Rejected)
            }
            _ = shared.closed.fired() => Err(Error::MultiplexerClosed),
        }
    }

    /// Accept the next inbound stream.
    ///
    /// Streams the remote closed while they sat in the backlog are skipped.
    /// Cancel safe: dropping the future before it completes leaves queued
    /// streams in place.
    ///
    /// # Errors
    ///
    /// - [`Error::MultiplexerClosed`] if the multiplexer shut down
    pub async fn accept_stream(&self) -> Result<Stream> {
        loop {
            if let Some(stream) = self.accept_next().await? {
                return Ok(stream);
            }
        }
    }

    /// Alias of [`Multiplexer::accept_stream`], for listener-style callers.
    pub async fn accept(&self) -> Result<Stream> {
        self.accept_stream().await
    }

    /// Accept one queued stream; `None` if it went stale in the backlog.
    async fn accept_next(&self) -> Result<Option<Stream>> {
        let shared = &self.shared;
        if shared.closed.is_fired() {
            return Err(Error::MultiplexerClosed);
        }

        let id = {
            let mut backlog = tokio::select! {
                backlog = shared.backlog.lock() => backlog,
                _ = shared.closed.fired() => return Err(Error::MultiplexerClosed),
            };
            tokio::select! {
                id = backlog.recv() => id.ok_or(Error::MultiplexerClosed)?,
                _ = shared.closed.fired() => return Err(Error::MultiplexerClosed),
            }
        };

        let Some(state) = lock(&shared.table).streams.get(&id).cloned() else {
            return Ok(None);
        };
        let stream = Stream::new(state, shared.clone(), true);

        let mut buffer = tokio::select! {
            biased;
            _ = stream.state().remote_closed.fired() => {
                tracing::debug!(stream = id, "skipping stale inbound stream");
                return Ok(None);
            }
            buffer = shared.pool.acquire() => buffer?,
            _ = shared.closed.fired() => return Err(Error::MultiplexerClosed),
        };
        stream.state().established.fire();
        buffer.encode_accept(id, shared.config.stream_receive_window as u64);
        shared.submit(buffer)?;

        tracing::debug!(stream = id, "inbound stream accepted");
        Ok(Some(stream))
    }

    /// Whether this side allocates even stream identifiers.
    pub fn is_even(&self) -> bool {
        self.shared.even
    }

    /// Address describing this side of the multiplexer.
    pub fn local_addr(&self) -> MultiplexerAddress {
        MultiplexerAddress::new(self.shared.even)
    }

    /// Configuration in effect, after normalisation.
    pub fn configuration(&self) -> &Configuration {
        &self.shared.config
    }

    /// Wait until the multiplexer has closed, for any reason.
    pub async fn closed(&self) {
        self.shared.closed.fired().await;
    }

    /// Whether the multiplexer has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_fired()
    }

    /// The failure that closed the multiplexer, if any.
    ///
    /// `None` while running and after a graceful [`Multiplexer::close`].
    pub fn internal_error(&self) -> Option<Arc<Error>> {
        lock(&self.shared.internal_error).clone()
    }

    /// Close the multiplexer and its carrier. Every blocked stream operation
    /// fails with [`Error::MultiplexerClosed`]. Idempotent.
    pub fn close(&self) {
        self.shared.close_with_error(None);
    }
}

/// Supervisor - closes the multiplexer on the first reader/writer failure or
/// heartbeat timeout, then stops the background tasks. Aborting the reader
/// and writer drops both carrier halves, closing the carrier.
async fn supervise(
    shared: Arc<Shared>,
    mut reader: JoinHandle<Result<()>>,
    mut writer: JoinHandle<Result<()>>,
    aggregator: JoinHandle<()>,
    mut heartbeats: mpsc::Receiver<()>,
) {
    let timeout = shared.config.maximum_heartbeat_receive_interval;
    let monitor = !timeout.is_zero();
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);

    let failure = loop {
        tokio::select! {
            biased;
            _ = shared.closed.fired() => break None,
            result = &mut reader => break Some(Error::Read(Box::new(task_failure(result)))),
            result = &mut writer => break Some(Error::Write(Box::new(task_failure(result)))),
            Some(()) = heartbeats.recv() => {
                if monitor {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
            }
            _ = &mut deadline, if monitor => break Some(Error::HeartbeatTimeout),
        }
    };

    if let Some(error) = failure {
        shared.close_with_error(Some(error));
    }
    reader.abort();
    writer.abort();
    aggregator.abort();
}

fn task_failure(result: std::result::Result<Result<()>, JoinError>) -> Error {
    match result {
        Ok(Err(error)) => error,
        Ok(Ok(())) => Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "carrier task exited",
        )),
        Err(join) => Error::Io(io::Error::new(io::ErrorKind::Other, join)),
    }
}
