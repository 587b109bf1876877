//! Error types for wiremux.

use std::io;

use thiserror::Error;

/// Main error type for all multiplexer and stream operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the carrier.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream has been closed locally.
    #[error("stream closed")]
    Closed,

    /// The stream has been closed for writing locally.
    #[error("closed for writing")]
    WriteClosed,

    /// The remote end has closed the stream.
    #[error("remote: stream closed")]
    RemoteClosed,

    /// The multiplexer has been closed, either explicitly or due to failure.
    #[error("multiplexer closed")]
    MultiplexerClosed,

    /// The remote end closed the stream before accepting it.
    #[error("stream rejected")]
    Rejected,

    /// A read or write deadline has passed.
    #[error("deadline exceeded")]
    Timeout,

    /// The local outbound stream identifier space wrapped around.
    #[error("local stream identifiers exhausted")]
    IdentifiersExhausted,

    /// The remote sent a malformed or out-of-range message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reader task failed.
    #[error("read error: {0}")]
    Read(#[source] Box<Error>),

    /// The writer task failed.
    #[error("write error: {0}")]
    Write(#[source] Box<Error>),

    /// No heartbeat arrived within the configured maximum receive interval.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

impl Error {
    /// Shorthand for building a protocol violation.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(inner) => inner.kind(),
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Closed | Error::MultiplexerClosed => io::ErrorKind::NotConnected,
            Error::WriteClosed => io::ErrorKind::BrokenPipe,
            Error::RemoteClosed => io::ErrorKind::ConnectionReset,
            Error::Rejected => io::ErrorKind::ConnectionRefused,
            Error::IdentifiersExhausted => io::ErrorKind::AddrNotAvailable,
            Error::Protocol(_) => io::ErrorKind::InvalidData,
            Error::Read(_) | Error::Write(_) | Error::HeartbeatTimeout => {
                io::ErrorKind::ConnectionAborted
            }
        };
        match err {
            Error::Io(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
