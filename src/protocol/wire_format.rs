//! Wire format constants and primitive encodings.
//!
//! Every message starts with a one-byte kind tag:
//! ```text
//! Heartbeat:        <kind>
//! Open:             <kind> <stream:uvarint64> <window:uvarint64>
//! Accept:           <kind> <stream:uvarint64> <window:uvarint64>
//! Data:             <kind> <stream:uvarint64> <length:u16 BE> <payload>
//! WindowIncrement:  <kind> <stream:uvarint64> <increment:uvarint64>
//! CloseWrite:       <kind> <stream:uvarint64>
//! Close:            <kind> <stream:uvarint64>
//! ```
//!
//! Varints are unsigned LEB128, at most 10 bytes for a `u64`.

use crate::error::{Error, Result};

/// Maximum encoded length of a 64-bit unsigned varint.
pub const MAX_VARINT_LEN64: usize = 10;

/// Maximum payload carried by a single data message.
pub const MAX_DATA_BLOCK_SIZE: usize = u16::MAX as usize;

/// Maximum size of an open message.
pub const OPEN_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64 + MAX_VARINT_LEN64;

/// Maximum size of an accept message.
pub const ACCEPT_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64 + MAX_VARINT_LEN64;

/// Maximum size of a data message.
pub const DATA_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64 + 2 + MAX_DATA_BLOCK_SIZE;

/// Maximum size of a window increment message.
pub const WINDOW_INCREMENT_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64 + MAX_VARINT_LEN64;

/// Maximum size of a close write message.
pub const CLOSE_WRITE_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64;

/// Maximum size of a close message.
pub const CLOSE_MAX_SIZE: usize = 1 + MAX_VARINT_LEN64;

/// Maximum size of any single message.
pub const MAX_MESSAGE_SIZE: usize = DATA_MAX_SIZE;

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Multiplexer liveness signal.
    Heartbeat = 0,
    /// Request to open a stream.
    Open = 1,
    /// Acceptance of an opened stream.
    Accept = 2,
    /// Stream payload.
    Data = 3,
    /// Additional send credit for the peer.
    WindowIncrement = 4,
    /// Sender will write no more data.
    CloseWrite = 5,
    /// Stream fully closed.
    Close = 6,
}

impl MessageKind {
    /// Whether this kind carries a stream identifier.
    #[inline]
    pub fn has_stream(self) -> bool {
        self != MessageKind::Heartbeat
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageKind::Heartbeat,
            1 => MessageKind::Open,
            2 => MessageKind::Accept,
            3 => MessageKind::Data,
            4 => MessageKind::WindowIncrement,
            5 => MessageKind::CloseWrite,
            6 => MessageKind::Close,
            other => {
                return Err(Error::protocol(format!(
                    "received unknown message kind: {other:#04x}"
                )))
            }
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

/// Encode `value` as an unsigned varint into `buf`, returning the length used.
///
/// # Panics
///
/// Panics if `buf` is shorter than the encoding (at most [`MAX_VARINT_LEN64`]).
pub fn encode_uvarint(buf: &mut [u8], mut value: u64) -> usize {
    let mut index = 0;
    while value >= 0x80 {
        buf[index] = (value as u8) | 0x80;
        value >>= 7;
        index += 1;
    }
    buf[index] = value as u8;
    index + 1
}

/// Incremental varint decoder, fed one byte at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct UvarintDecoder {
    value: u64,
    shift: u32,
    count: usize,
}

impl UvarintDecoder {
    /// Feed one byte. Returns the decoded value once the final byte arrives.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        if self.count == MAX_VARINT_LEN64 - 1 && byte > 1 {
            return Err(Error::protocol("varint overflows a 64-bit integer"));
        }
        self.count += 1;
        if byte < 0x80 {
            return Ok(Some(self.value | (u64::from(byte) << self.shift)));
        }
        if self.count == MAX_VARINT_LEN64 {
            return Err(Error::protocol("varint overflows a 64-bit integer"));
        }
        self.value |= u64::from(byte & 0x7f) << self.shift;
        self.shift += 7;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `buf` through a decoder, returning the value and bytes consumed.
    fn decode_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
        let mut decoder = UvarintDecoder::default();
        for (index, &byte) in buf.iter().enumerate() {
            if let Some(value) = decoder.push(byte)? {
                return Ok(Some((value, index + 1)));
            }
        }
        Ok(None)
    }

    #[test]
    fn test_kind_values_are_stable() {
        assert_eq!(u8::from(MessageKind::Heartbeat), 0);
        assert_eq!(u8::from(MessageKind::Open), 1);
        assert_eq!(u8::from(MessageKind::Accept), 2);
        assert_eq!(u8::from(MessageKind::Data), 3);
        assert_eq!(u8::from(MessageKind::WindowIncrement), 4);
        assert_eq!(u8::from(MessageKind::CloseWrite), 5);
        assert_eq!(u8::from(MessageKind::Close), 6);
    }

    #[test]
    fn test_kind_from_byte() {
        for byte in 0u8..=6 {
            let kind = MessageKind::try_from(byte).unwrap();
            assert_eq!(u8::from(kind), byte);
        }
        let err = MessageKind::try_from(7).unwrap_err();
        assert!(err.to_string().contains("unknown message kind"));
    }

    #[test]
    fn test_heartbeat_has_no_stream() {
        assert!(!MessageKind::Heartbeat.has_stream());
        assert!(MessageKind::Data.has_stream());
    }

    #[test]
    fn test_max_sizes() {
        assert_eq!(MAX_MESSAGE_SIZE, 1 + 10 + 2 + 65535);
        assert_eq!(CLOSE_MAX_SIZE, 11);
        assert_eq!(WINDOW_INCREMENT_MAX_SIZE, 21);
    }

    #[test]
    fn test_uvarint_known_encodings() {
        let mut buf = [0u8; MAX_VARINT_LEN64];
        assert_eq!(encode_uvarint(&mut buf, 1), 1);
        assert_eq!(buf[0], 0x01);

        assert_eq!(encode_uvarint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0xAC, 0x02]);

        assert_eq!(encode_uvarint(&mut buf, u64::MAX), 10);
        assert_eq!(buf[9], 0x01);
    }

    #[test]
    fn test_decode_uvarint() {
        let mut buf = [0u8; MAX_VARINT_LEN64];
        for value in [0, 5, 300, 65_536, u64::MAX] {
            let len = encode_uvarint(&mut buf, value);
            assert_eq!(decode_uvarint(&buf[..len]).unwrap(), Some((value, len)));
        }
    }

    #[test]
    fn test_decode_uvarint_incomplete() {
        assert_eq!(decode_uvarint(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(decode_uvarint(&[]).unwrap(), None);
    }

    #[test]
    fn test_decode_uvarint_overflow() {
        // Tenth byte may only contribute the top bit.
        let mut bytes = [0xFFu8; 10];
        bytes[9] = 0x02;
        assert!(decode_uvarint(&bytes).is_err());

        // Eleven-byte encodings are always invalid.
        let bytes = [0x80u8; 11];
        assert!(decode_uvarint(&bytes).is_err());
    }
}
