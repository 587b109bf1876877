//! Control message aggregation.
//!
//! Window increments, close-writes and closes are produced from contexts that
//! must not block on buffer availability (a stream read, a stream drop, the
//! reader task rejecting an open). They are queued here instead, merged per
//! stream, and packed into as few outbound buffers as possible:
//!
//! - increments for the same stream are summed
//! - a close supersedes any pending increment or close-write for its stream
//! - a buffer is packed increments first, then close-writes, then closes

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::multiplexer::Shared;
use crate::protocol::MessageBuffer;

/// A control message request for the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlUpdate {
    /// Grant the remote `amount` more bytes of send window.
    WindowIncrement { stream: u64, amount: u64 },
    /// Tell the remote that no more data will be written.
    CloseWrite(u64),
    /// Tell the remote the stream is closed.
    Close(u64),
}

/// Control messages waiting for a buffer.
#[derive(Debug, Default)]
struct PendingControl {
    increments: BTreeMap<u64, u64>,
    close_writes: BTreeSet<u64>,
    closes: BTreeSet<u64>,
}

impl PendingControl {
    fn is_empty(&self) -> bool {
        self.increments.is_empty() && self.close_writes.is_empty() && self.closes.is_empty()
    }

    fn apply(&mut self, update: ControlUpdate) {
        match update {
            ControlUpdate::WindowIncrement { stream, amount } => {
                if amount == 0 {
                    return;
                }
                let total = self.increments.entry(stream).or_default();
                *total = total.saturating_add(amount);
            }
            ControlUpdate::CloseWrite(stream) => {
                self.close_writes.insert(stream);
            }
            ControlUpdate::Close(stream) => {
                self.increments.remove(&stream);
                self.close_writes.remove(&stream);
                self.closes.insert(stream);
            }
        }
    }

    /// Move as many pending messages as fit into `buffer`.
    fn pack(&mut self, buffer: &mut MessageBuffer) {
        while buffer.can_encode_window_increment() {
            let Some((stream, amount)) = self.increments.pop_first() else {
                break;
            };
            buffer.encode_window_increment(stream, amount);
        }
        while buffer.can_encode_close_write() {
            let Some(stream) = self.close_writes.pop_first() else {
                break;
            };
            buffer.encode_close_write(stream);
        }
        while buffer.can_encode_close() {
            let Some(stream) = self.closes.pop_first() else {
                break;
            };
            buffer.encode_close(stream);
        }
    }
}

/// Aggregator loop - runs until the multiplexer closes.
pub(crate) async fn aggregator_loop(
    shared: Arc<Shared>,
    mut updates: mpsc::UnboundedReceiver<ControlUpdate>,
) {
    let mut pending = PendingControl::default();
    // Kept across iterations so the aggregator holds its place in the pool's
    // wait queue while updates keep arriving.
    let mut acquiring = None;

    loop {
        if acquiring.is_none() && !pending.is_empty() {
            acquiring = Some(Box::pin(shared.pool.acquire()));
        }
        tokio::select! {
            biased;
            _ = shared.closed.fired() => return,
            update = updates.recv() => match update {
                Some(update) => pending.apply(update),
                None => return,
            },
            buffer = in_flight(&mut acquiring), if acquiring.is_some() => {
                acquiring = None;
                let Ok(mut buffer) = buffer else {
                    return;
                };
                pending.pack(&mut buffer);
                if shared.submit(buffer).is_err() {
                    return;
                }
            }
        }
    }
}

/// Await the future in `slot`, or never complete if there is none.
async fn in_flight<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::CarrierReader;
    use crate::protocol::Frame;

    async fn frames_of(buffer: &mut MessageBuffer) -> Vec<Frame> {
        let mut bytes = Vec::new();
        buffer.drain_into(&mut bytes);
        let mut reader = CarrierReader::new(&bytes[..]);
        let mut frames = Vec::new();
        while let Ok(frame) = reader.read_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_increments_are_summed() {
        let mut pending = PendingControl::default();
        pending.apply(ControlUpdate::WindowIncrement { stream: 3, amount: 10 });
        pending.apply(ControlUpdate::WindowIncrement { stream: 3, amount: 5 });
        pending.apply(ControlUpdate::WindowIncrement { stream: 5, amount: 1 });
        assert_eq!(pending.increments.get(&3), Some(&15));
        assert_eq!(pending.increments.get(&5), Some(&1));
    }

    #[test]
    fn test_zero_increment_ignored() {
        let mut pending = PendingControl::default();
        pending.apply(ControlUpdate::WindowIncrement { stream: 3, amount: 0 });
        assert!(pending.is_empty());
    }

    #[test]
    fn test_close_supersedes_other_updates() {
        let mut pending = PendingControl::default();
        pending.apply(ControlUpdate::WindowIncrement { stream: 7, amount: 100 });
        pending.apply(ControlUpdate::CloseWrite(7));
        pending.apply(ControlUpdate::Close(7));

        assert!(pending.increments.is_empty());
        assert!(pending.close_writes.is_empty());
        assert!(pending.closes.contains(&7));
    }

    #[tokio::test]
    async fn test_pack_order() {
        let mut pending = PendingControl::default();
        pending.apply(ControlUpdate::Close(9));
        pending.apply(ControlUpdate::CloseWrite(4));
        pending.apply(ControlUpdate::WindowIncrement { stream: 2, amount: 64 });

        let mut buffer = MessageBuffer::new();
        pending.pack(&mut buffer);
        assert!(pending.is_empty());

        assert_eq!(
            frames_of(&mut buffer).await,
            vec![
                Frame::WindowIncrement {
                    stream: 2,
                    increment: 64
                },
                Frame::CloseWrite { stream: 4 },
                Frame::Close { stream: 9 },
            ]
        );
    }

    #[tokio::test]
    async fn test_pack_spills_into_next_buffer() {
        let mut pending = PendingControl::default();
        for stream in 1..=10_000u64 {
            pending.apply(ControlUpdate::WindowIncrement {
                stream,
                amount: u64::MAX,
            });
        }

        let mut first = MessageBuffer::new();
        pending.pack(&mut first);
        assert!(!pending.is_empty());
        assert!(!first.can_encode_window_increment());

        let mut second = MessageBuffer::new();
        pending.pack(&mut second);
        assert!(pending.is_empty());

        let total = frames_of(&mut first).await.len() + frames_of(&mut second).await.len();
        assert_eq!(total, 10_000);
    }
}
