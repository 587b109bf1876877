//! Decoded inbound message headers.
//!
//! A [`Frame`] describes one inbound message with every fixed field decoded.
//! For [`Frame::Data`] the payload is *not* included: it is still pending on
//! the carrier, and the reader routes exactly `length` bytes to the stream's
//! receive buffer (or discards them).

use super::wire_format::MessageKind;

/// One decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Multiplexer liveness signal.
    Heartbeat,
    /// Remote requests a new stream with the given receive window.
    Open { stream: u64, window: u64 },
    /// Remote accepted one of our streams with the given receive window.
    Accept { stream: u64, window: u64 },
    /// `length` payload bytes follow on the carrier (never zero).
    Data { stream: u64, length: u16 },
    /// Remote grants additional send credit (never zero).
    WindowIncrement { stream: u64, increment: u64 },
    /// Remote will send no more data on the stream.
    CloseWrite { stream: u64 },
    /// Remote closed the stream.
    Close { stream: u64 },
}

impl Frame {
    /// Kind tag of this frame.
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Heartbeat => MessageKind::Heartbeat,
            Frame::Open { .. } => MessageKind::Open,
            Frame::Accept { .. } => MessageKind::Accept,
            Frame::Data { .. } => MessageKind::Data,
            Frame::WindowIncrement { .. } => MessageKind::WindowIncrement,
            Frame::CloseWrite { .. } => MessageKind::CloseWrite,
            Frame::Close { .. } => MessageKind::Close,
        }
    }

    /// Stream identifier, if the frame carries one.
    pub fn stream(&self) -> Option<u64> {
        match *self {
            Frame::Heartbeat => None,
            Frame::Open { stream, .. }
            | Frame::Accept { stream, .. }
            | Frame::Data { stream, .. }
            | Frame::WindowIncrement { stream, .. }
            | Frame::CloseWrite { stream }
            | Frame::Close { stream } => Some(stream),
        }
    }
}
