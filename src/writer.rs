//! Dedicated writer task - the only code that touches the carrier's write half.
//!
//! Producers (stream writers, open/accept, the control aggregator) fill a
//! [`MessageBuffer`] taken from the pool and hand it over through an unbounded
//! channel. The channel never grows past the pool size because every queued
//! buffer holds a pool slot until the writer releases it.
//!
//! # Architecture
//!
//! ```text
//! Stream::write ──┐
//! open / accept ──┼─► mpsc::UnboundedSender<MessageBuffer> ─► Writer Task ─► Carrier
//! Aggregator    ──┘                                              │
//!                                 BufferPool ◄── release ────────┘
//! ```
//!
//! When heartbeats are enabled the writer also emits a single heartbeat byte
//! on every tick of the transmit interval.

use std::future;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::multiplexer::Shared;
use crate::protocol::{MessageBuffer, MessageKind};

/// Maximum buffers written between two flushes.
const MAX_BATCH_SIZE: usize = 16;

const HEARTBEAT: [u8; 1] = [MessageKind::Heartbeat as u8];

/// Writer loop - drains pending buffers to the carrier until the multiplexer
/// closes or a write fails.
///
/// Only returns on failure; closure is reported as
/// [`Error::MultiplexerClosed`], which the supervisor ignores.
pub(crate) async fn writer_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut pending: mpsc::UnboundedReceiver<MessageBuffer>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut heartbeat = heartbeat_ticker(&shared);

    loop {
        tokio::select! {
            biased;
            _ = shared.closed.fired() => return Err(Error::MultiplexerClosed),
            first = pending.recv() => {
                let Some(first) = first else {
                    return Err(Error::MultiplexerClosed);
                };

                write_buffer(&shared, &mut writer, first).await?;
                let mut written = 1;
                while written < MAX_BATCH_SIZE {
                    match pending.try_recv() {
                        Ok(next) => write_buffer(&shared, &mut writer, next).await?,
                        Err(_) => break,
                    }
                    written += 1;
                }
                writer.flush().await?;
            }
            _ = tick(&mut heartbeat) => {
                writer.write_all(&HEARTBEAT).await?;
                writer.flush().await?;
                tracing::trace!("heartbeat sent");
            }
        }
    }
}

async fn write_buffer<W>(shared: &Shared, writer: &mut W, mut buffer: MessageBuffer) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    buffer.write_to(writer).await?;
    shared.pool.release(buffer);
    Ok(())
}

fn heartbeat_ticker(shared: &Shared) -> Option<Interval> {
    let period = shared.config.heartbeat_transmit_interval;
    if period.is_zero() {
        return None;
    }
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}
