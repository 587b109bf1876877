//! Network-style addresses for multiplexers and streams.
//!
//! Both report the network name [`NETWORK`]. A stream address names the
//! stream identifier and which end it refers to; a multiplexer address names
//! the identifier parity the local side allocates.

use std::fmt;

/// Network name reported by every multiplexed address.
pub const NETWORK: &str = "multiplexed";

/// Address of one end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    remote: bool,
    identifier: u64,
}

impl StreamAddress {
    pub(crate) fn local(identifier: u64) -> Self {
        Self {
            remote: false,
            identifier,
        }
    }

    pub(crate) fn remote(identifier: u64) -> Self {
        Self {
            remote: true,
            identifier,
        }
    }

    /// Always [`NETWORK`].
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    /// Stream identifier.
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    /// Whether this is the remote end.
    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = if self.remote { "remote" } else { "local" };
        write!(f, "{end}:{}", self.identifier)
    }
}

/// Address of a multiplexer, as returned by
/// [`Multiplexer::local_addr`](crate::Multiplexer::local_addr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MultiplexerAddress {
    even: bool,
}

impl MultiplexerAddress {
    pub(crate) fn new(even: bool) -> Self {
        Self { even }
    }

    /// Always [`NETWORK`].
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    /// Whether the multiplexer allocates even stream identifiers.
    pub fn is_even(&self) -> bool {
        self.even
    }
}

impl fmt::Display for MultiplexerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.even { "even" } else { "odd" })
    }
}
