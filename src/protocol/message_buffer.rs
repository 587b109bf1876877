//! Reusable outbound message buffer.
//!
//! A [`MessageBuffer`] is a [`RingBuffer`] sized to hold any single message,
//! so an empty buffer can always accept one encode call. Control messages are
//! small enough that several can be packed into one buffer; callers check
//! `can_encode_*` before packing more.
//!
//! Encoding into a buffer without enough free space is a caller bug, not a
//! peer error, and panics.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::wire_format::{
    encode_uvarint, MessageKind, ACCEPT_MAX_SIZE, CLOSE_MAX_SIZE, CLOSE_WRITE_MAX_SIZE,
    DATA_MAX_SIZE, MAX_DATA_BLOCK_SIZE, MAX_MESSAGE_SIZE, MAX_VARINT_LEN64, OPEN_MAX_SIZE,
    WINDOW_INCREMENT_MAX_SIZE,
};
use crate::ring::RingBuffer;

/// Buffer for batching encoded messages before a single carrier write.
#[derive(Debug)]
pub struct MessageBuffer {
    buffer: RingBuffer,
    /// Scratch space for varint and big-endian length encoding.
    scratch: [u8; MAX_VARINT_LEN64],
}

impl MessageBuffer {
    /// Create an empty buffer able to hold any single message.
    pub fn new() -> Self {
        Self {
            buffer: RingBuffer::new(MAX_MESSAGE_SIZE),
            scratch: [0u8; MAX_VARINT_LEN64],
        }
    }

    /// Number of encoded bytes waiting to be written.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.used()
    }

    /// Whether nothing has been encoded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard encoded contents, keeping the backing storage.
    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    fn ensure_free_space(&self, amount: usize) {
        assert!(
            self.buffer.free() >= amount,
            "message buffer not guaranteed to have sufficient free space"
        );
    }

    fn put(&mut self, bytes: &[u8]) {
        // Space was checked up front.
        let _ = self.buffer.write(bytes);
    }

    fn put_kind(&mut self, kind: MessageKind) {
        let _ = self.buffer.write_byte(kind.into());
    }

    fn put_uvarint(&mut self, value: u64) {
        let length = encode_uvarint(&mut self.scratch, value);
        let _ = self.buffer.write(&self.scratch[..length]);
    }

    fn put_u16(&mut self, value: u16) {
        self.scratch[..2].copy_from_slice(&value.to_be_bytes());
        let _ = self.buffer.write(&self.scratch[..2]);
    }

    /// Encode a heartbeat message.
    pub fn encode_heartbeat(&mut self) {
        self.ensure_free_space(1);
        self.put_kind(MessageKind::Heartbeat);
    }

    /// Encode a stream open message.
    ///
    /// # Panics
    ///
    /// Panics if the buffer lacks room for a maximum-size open message.
    pub fn encode_open(&mut self, stream: u64, window: u64) {
        self.ensure_free_space(OPEN_MAX_SIZE);
        self.put_kind(MessageKind::Open);
        self.put_uvarint(stream);
        self.put_uvarint(window);
    }

    /// Encode a stream accept message.
    ///
    /// # Panics
    ///
    /// Panics if the buffer lacks room for a maximum-size accept message.
    pub fn encode_accept(&mut self, stream: u64, window: u64) {
        self.ensure_free_space(ACCEPT_MAX_SIZE);
        self.put_kind(MessageKind::Accept);
        self.put_uvarint(stream);
        self.put_uvarint(window);
    }

    /// Encode a stream data message.
    ///
    /// # Panics
    ///
    /// Panics if the buffer lacks room for a maximum-size data message, or if
    /// `data` is empty or larger than [`MAX_DATA_BLOCK_SIZE`].
    pub fn encode_data(&mut self, stream: u64, data: &[u8]) {
        self.ensure_free_space(DATA_MAX_SIZE);
        assert!(
            !data.is_empty() && data.len() <= MAX_DATA_BLOCK_SIZE,
            "data block length out of range"
        );
        self.put_kind(MessageKind::Data);
        self.put_uvarint(stream);
        self.put_u16(data.len() as u16);
        self.put(data);
    }

    /// Whether a window increment is guaranteed to fit.
    #[inline]
    pub fn can_encode_window_increment(&self) -> bool {
        self.buffer.free() >= WINDOW_INCREMENT_MAX_SIZE
    }

    /// Encode a stream window increment message.
    ///
    /// # Panics
    ///
    /// Panics if the buffer lacks room for a maximum-size increment message.
    pub fn encode_window_increment(&mut self, stream: u64, amount: u64) {
        self.ensure_free_space(WINDOW_INCREMENT_MAX_SIZE);
        self.put_kind(MessageKind::WindowIncrement);
        self.put_uvarint(stream);
        self.put_uvarint(amount);
    }

    /// Whether a close write message is guaranteed to fit.
    #[inline]
    pub fn can_encode_close_write(&self) -> bool {
        self.buffer.free() >= CLOSE_WRITE_MAX_SIZE
    }

    /// Encode a stream close write message.
    pub fn encode_close_write(&mut self, stream: u64) {
        self.ensure_free_space(CLOSE_WRITE_MAX_SIZE);
        self.put_kind(MessageKind::CloseWrite);
        self.put_uvarint(stream);
    }

    /// Whether a close message is guaranteed to fit.
    #[inline]
    pub fn can_encode_close(&self) -> bool {
        self.buffer.free() >= CLOSE_MAX_SIZE
    }

    /// Encode a stream close message.
    pub fn encode_close(&mut self, stream: u64) {
        self.ensure_free_space(CLOSE_MAX_SIZE);
        self.put_kind(MessageKind::Close);
        self.put_uvarint(stream);
    }

    /// Drain the buffer into an async writer.
    ///
    /// The buffer is empty afterwards on success.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let total = self.buffer.used();
        writer.write_all_buf(&mut self.buffer).await?;
        Ok(total)
    }

    /// Drain the buffer into a byte vector.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) {
        // Vec never refuses bytes.
        let _ = self.buffer.write_to(out);
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
