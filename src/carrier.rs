//! Carrier abstraction - the duplex byte transport under the multiplexer.
//!
//! Anything that is `AsyncRead + AsyncWrite` can carry a multiplexer:
//! - TCP or Unix domain sockets
//! - Child process pipes joined with [`tokio::io::join`]
//! - In-memory [`tokio::io::duplex`] pairs (tests)
//!
//! The multiplexer takes exclusive ownership of its carrier and closes it by
//! dropping both halves when it shuts down.
//!
//! # Example
//!
//! ```ignore
//! use wiremux::Multiplexer;
//!
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:4000").await?;
//! let multiplexer = Multiplexer::new(socket, false, None);
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::error::{Error, Result};
use crate::protocol::{Frame, MessageKind, UvarintDecoder};

/// Read buffer size for the carrier's read half.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// An ordered, reliable duplex byte transport.
///
/// Implemented for every type meeting the bounds.
pub trait Carrier: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Carrier for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Buffered read side of a carrier with message-level decoding helpers.
pub struct CarrierReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> CarrierReader<R> {
    /// Wrap a read half.
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
        }
    }

    /// Read a single byte.
    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.inner.read_u8().await
    }

    /// Read an unsigned LEB128 varint of at most 64 bits.
    pub async fn read_uvarint(&mut self) -> Result<u64> {
        let mut decoder = UvarintDecoder::default();
        loop {
            let byte = self.inner.read_u8().await?;
            if let Some(value) = decoder.push(byte)? {
                return Ok(value);
            }
        }
    }

    /// Read a big-endian `u16`.
    pub async fn read_u16(&mut self) -> io::Result<u16> {
        self.inner.read_u16().await
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await.map(|_| ())
    }

    /// Skip exactly `n` bytes.
    pub async fn discard(&mut self, n: usize) -> io::Result<()> {
        let mut limited = (&mut self.inner).take(n as u64);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped != n as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "carrier ended while discarding data",
            ));
        }
        Ok(())
    }

    /// Decode the next message header.
    ///
    /// Field-level violations (unknown kind, zero stream identifier, zero data
    /// length, zero window increment, varint overflow) are reported as
    /// [`Error::Protocol`]. For data frames the payload is left unread.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let kind = MessageKind::try_from(self.read_byte().await?)?;
        if !kind.has_stream() {
            return Ok(Frame::Heartbeat);
        }

        let stream = self.read_uvarint().await?;
        if stream == 0 {
            return Err(Error::protocol(format!(
                "zero-value stream identifier received (message kind {:#04x})",
                u8::from(kind)
            )));
        }

        Ok(match kind {
            MessageKind::Open => Frame::Open {
                stream,
                window: self.read_uvarint().await?,
            },
            MessageKind::Accept => Frame::Accept {
                stream,
                window: self.read_uvarint().await?,
            },
            MessageKind::Data => {
                let length = self.read_u16().await?;
                if length == 0 {
                    return Err(Error::protocol("zero-length data received"));
                }
                Frame::Data { stream, length }
            }
            MessageKind::WindowIncrement => {
                let increment = self.read_uvarint().await?;
                if increment == 0 {
                    return Err(Error::protocol("zero-valued window increment received"));
                }
                Frame::WindowIncrement { stream, increment }
            }
            MessageKind::CloseWrite => Frame::CloseWrite { stream },
            MessageKind::Close => Frame::Close { stream },
            MessageKind::Heartbeat => Frame::Heartbeat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frame_of(bytes: &[u8]) -> Result<Frame> {
        CarrierReader::new(bytes).read_frame().await
    }

    #[tokio::test]
    async fn test_read_uvarint() {
        let mut reader = CarrierReader::new(&[0xAC, 0x02, 0x07][..]);
        assert_eq!(reader.read_uvarint().await.unwrap(), 300);
        assert_eq!(reader.read_uvarint().await.unwrap(), 7);
        assert!(matches!(reader.read_uvarint().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_read_uvarint_overflow() {
        let bytes = [0xFFu8; 11];
        let mut reader = CarrierReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_uvarint().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_discard() {
        let mut reader = CarrierReader::new(&[1, 2, 3, 4, 5][..]);
        reader.discard(3).await.unwrap();
        assert_eq!(reader.read_byte().await.unwrap(), 4);

        let err = reader.discard(5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let err = frame_of(&[0x09, 0x01]).await.unwrap_err();
        assert!(err.to_string().contains("unknown message kind"));
    }

    #[tokio::test]
    async fn test_zero_stream_identifier() {
        let err = frame_of(&[6, 0]).await.unwrap_err();
        assert!(err.to_string().contains("zero-value stream identifier"));
    }

    #[tokio::test]
    async fn test_zero_length_data() {
        let err = frame_of(&[3, 1, 0, 0]).await.unwrap_err();
        assert!(err.to_string().contains("zero-length data"));
    }

    #[tokio::test]
    async fn test_zero_window_increment() {
        let err = frame_of(&[4, 1, 0]).await.unwrap_err();
        assert!(err.to_string().contains("zero-valued window increment"));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        assert!(matches!(frame_of(&[1, 1]).await, Err(Error::Io(_))));
        assert!(matches!(frame_of(&[]).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_needs_no_stream() {
        assert_eq!(frame_of(&[0]).await.unwrap(), Frame::Heartbeat);
    }
}
