//! Reader task - decodes inbound messages and routes them to streams.
//!
//! Every inbound message is validated against the stream's lifecycle before it
//! takes effect. Any violation is fatal for the whole multiplexer: the loop
//! returns the error and the supervisor records it as the internal error.
//!
//! Messages for streams that have already been closed locally are ignored
//! (data payloads are discarded), since the remote may legitimately send them
//! before it learns of the closure.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::aggregator::ControlUpdate;
use crate::carrier::CarrierReader;
use crate::error::{Error, Result};
use crate::multiplexer::Shared;
use crate::protocol::{Frame, MAX_DATA_BLOCK_SIZE};
use crate::stream::StreamState;

/// Reader loop state.
struct Router {
    shared: Arc<Shared>,
    backlog: mpsc::Sender<u64>,
    heartbeats: mpsc::Sender<()>,
    largest_inbound: u64,
    scratch: Box<[u8]>,
}

/// Reader loop - runs until the carrier fails or a protocol violation occurs.
pub(crate) async fn reader_loop<R>(
    shared: Arc<Shared>,
    reader: R,
    backlog: mpsc::Sender<u64>,
    heartbeats: mpsc::Sender<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = CarrierReader::new(reader);
    let mut router = Router {
        shared,
        backlog,
        heartbeats,
        largest_inbound: 0,
        scratch: vec![0u8; MAX_DATA_BLOCK_SIZE].into_boxed_slice(),
    };

    loop {
        let frame = reader.read_frame().await?;
        router.route(frame, &mut reader).await?;
    }
}

impl Router {
    async fn route<R>(&mut self, frame: Frame, reader: &mut CarrierReader<R>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let Some(id) = frame.stream() else {
            // Strobe; a full channel already holds an unconsumed beat.
            let _ = self.heartbeats.try_send(());
            tracing::trace!("heartbeat received");
            return Ok(());
        };
        let kind = u8::from(frame.kind());
        let outbound = self.shared.is_outbound(id);

        let stream = match frame {
            Frame::Open { .. } => {
                if outbound {
                    return Err(Error::protocol(
                        "outbound stream identifier used by remote to open stream",
                    ));
                }
                if id <= self.largest_inbound {
                    return Err(Error::protocol(
                        "remote stream identifiers not monotonically increasing",
                    ));
                }
                self.largest_inbound = id;
                None
            }
            Frame::Accept { .. } if !outbound => {
                return Err(Error::protocol(
                    "inbound stream identifier used by remote to accept stream",
                ));
            }
            _ => {
                if !outbound && id > self.largest_inbound {
                    return Err(Error::protocol(format!(
                        "message ({kind:#04x}) received for unopened inbound stream identifier"
                    )));
                }
                self.shared.lookup(id, kind)?
            }
        };

        match frame {
            Frame::Heartbeat => Ok(()),
            Frame::Open { window, .. } => self.open(id, window),
            Frame::Accept { window, .. } => {
                let Some(stream) = stream else {
                    return Ok(());
                };
                if stream.established.is_fired() {
                    return Err(Error::protocol("remote accepted the same stream twice"));
                }
                if stream.remote_closed.is_fired() {
                    return Err(Error::protocol("remote accepted stream after closing it"));
                }
                stream.set_send_window(window);
                stream.established.fire();
                Ok(())
            }
            Frame::Data { length, .. } => {
                let length = usize::from(length);
                let Some(stream) = stream else {
                    reader.discard(length).await?;
                    return Ok(());
                };
                if !stream.established.is_fired() {
                    return Err(Error::protocol("data received for partially established stream"));
                }
                if stream.remote_closed_write.is_fired() {
                    return Err(Error::protocol("data received for write-closed stream"));
                }
                if stream.remote_closed.is_fired() {
                    return Err(Error::protocol("data received for closed stream"));
                }
                let payload = &mut self.scratch[..length];
                reader.read_exact(payload).await?;
                stream.deliver(payload)
            }
            Frame::WindowIncrement { increment, .. } => {
                let Some(stream) = stream else {
                    return Ok(());
                };
                if outbound && !stream.established.is_fired() {
                    return Err(Error::protocol(
                        "window increment received for partially established outbound stream",
                    ));
                }
                if stream.remote_closed.is_fired() {
                    return Err(Error::protocol("window increment received for closed stream"));
                }
                stream.grant(increment)
            }
            Frame::CloseWrite { .. } => {
                let Some(stream) = stream else {
                    return Ok(());
                };
                if outbound && !stream.established.is_fired() {
                    return Err(Error::protocol(
                        "close write received for partially established outbound stream",
                    ));
                }
                if stream.remote_closed.is_fired() {
                    return Err(Error::protocol("close write received for closed stream"));
                }
                if !stream.remote_closed_write.fire() {
                    return Err(Error::protocol(
                        "close write received for the same stream twice",
                    ));
                }
                Ok(())
            }
            Frame::Close { .. } => {
                let Some(stream) = stream else {
                    return Ok(());
                };
                if !stream.remote_closed.fire() {
                    return Err(Error::protocol("close received the same stream twice"));
                }
                Ok(())
            }
        }
    }

    /// Register an inbound stream and queue it for acceptance, or reject it
    /// if the backlog is full.
    fn open(&mut self, id: u64, window: u64) -> Result<()> {
        match self.backlog.try_reserve() {
            Ok(slot) => {
                let state = Arc::new(StreamState::new(
                    id,
                    self.shared.config.stream_receive_window,
                ));
                state.set_send_window(window);
                self.shared.register(state);
                slot.send(id);
                tracing::debug!(stream = id, "inbound stream queued for accept");
                Ok(())
            }
            Err(TrySendError::Full(())) => {
                tracing::debug!(stream = id, "accept backlog full, rejecting stream");
                self.shared.enqueue(ControlUpdate::Close(id))
            }
            Err(TrySendError::Closed(())) => Err(Error::MultiplexerClosed),
        }
    }
}
