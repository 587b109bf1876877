//! # wiremux
//!
//! Bidirectional stream multiplexing over a single ordered byte transport.
//!
//! A [`Multiplexer`] turns one [`Carrier`] (a socket, a pair of process pipes,
//! an in-memory duplex) into any number of independent, flow-controlled
//! [`Stream`]s. Either side may open streams; identifiers are split by parity
//! so no coordination is needed.
//!
//! ## Architecture
//!
//! - **Streams**: per-stream receive buffer ([`ring::RingBuffer`]) and
//!   credit-based send window, half-close, full close, deadlines
//! - **Wire protocol**: seven message kinds with varint fields, see
//!   [`protocol`]
//! - **Background tasks**: reader, writer, control aggregator and supervisor,
//!   sharing a fixed pool of outbound message buffers
//!
//! ## Example
//!
//! ```ignore
//! use wiremux::Multiplexer;
//!
//! #[tokio::main]
//! async fn main() -> wiremux::Result<()> {
//!     let (left, right) = tokio::io::duplex(64 * 1024);
//!     let client = Multiplexer::new(left, false, None);
//!     let server = Multiplexer::new(right, true, None);
//!
//!     let accepted = tokio::spawn(async move { server.accept_stream().await });
//!     let stream = client.open_stream().await?;
//!     stream.write_all(b"hello").await?;
//!     stream.close_write().await?;
//!
//!     let remote = accepted.await.unwrap()?;
//!     let mut buf = [0u8; 5];
//!     remote.read(&mut buf).await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod carrier;
pub mod config;
pub mod error;
pub mod protocol;
pub mod ring;

mod aggregator;
mod compat;
mod multiplexer;
mod pool;
mod reader;
mod stream;
mod sync;
mod writer;

pub use address::{MultiplexerAddress, StreamAddress};
pub use carrier::Carrier;
pub use compat::StreamIo;
pub use config::Configuration;
pub use error::{Error, Result};
pub use multiplexer::Multiplexer;
pub use stream::Stream;
