//! Protocol module - wire format, message encoding, and decoded frames.
//!
//! This module implements the binary protocol spoken over the carrier:
//! - Message kinds, size bounds and varint encoding
//! - Reusable outbound message buffers
//! - Decoded inbound frame descriptors

mod frame;
mod message_buffer;
mod wire_format;

pub use frame::Frame;
pub use message_buffer::MessageBuffer;
pub use wire_format::{
    encode_uvarint, MessageKind, UvarintDecoder, ACCEPT_MAX_SIZE, CLOSE_MAX_SIZE,
    CLOSE_WRITE_MAX_SIZE, DATA_MAX_SIZE, MAX_DATA_BLOCK_SIZE, MAX_MESSAGE_SIZE, MAX_VARINT_LEN64,
    OPEN_MAX_SIZE, WINDOW_INCREMENT_MAX_SIZE,
};
