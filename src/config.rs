//! Multiplexer configuration.
//!
//! A [`Configuration`] is fixed when the multiplexer is built. Out-of-range
//! values are normalised rather than rejected.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wiremux::Configuration;
//!
//! let configuration = Configuration::default()
//!     .with_stream_receive_window(128 * 1024)
//!     .with_accept_backlog(16)
//!     .with_heartbeat_transmit_interval(Duration::from_secs(2));
//! assert_eq!(configuration.accept_backlog, 16);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-stream receive window (64 KiB).
pub const DEFAULT_STREAM_RECEIVE_WINDOW: usize = 64 * 1024;

/// Default number of outbound message buffers.
pub const DEFAULT_WRITE_BUFFER_COUNT: usize = 5;

/// Default accept backlog depth.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 5;

/// Default heartbeat transmission interval.
pub const DEFAULT_HEARTBEAT_TRANSMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Default maximum silence tolerated before a heartbeat timeout.
pub const DEFAULT_MAXIMUM_HEARTBEAT_RECEIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Multiplexer tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Receive buffer size for each stream, advertised to the peer as the
    /// initial window.
    pub stream_receive_window: usize,
    /// Number of outbound message buffers shared by all streams.
    pub write_buffer_count: usize,
    /// Maximum number of inbound streams waiting to be accepted.
    pub accept_backlog: usize,
    /// Interval between outbound heartbeats. Zero disables them.
    pub heartbeat_transmit_interval: Duration,
    /// Maximum time without an inbound heartbeat before the multiplexer fails.
    /// Zero disables the check.
    pub maximum_heartbeat_receive_interval: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            stream_receive_window: DEFAULT_STREAM_RECEIVE_WINDOW,
            write_buffer_count: DEFAULT_WRITE_BUFFER_COUNT,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            heartbeat_transmit_interval: DEFAULT_HEARTBEAT_TRANSMIT_INTERVAL,
            maximum_heartbeat_receive_interval: DEFAULT_MAXIMUM_HEARTBEAT_RECEIVE_INTERVAL,
        }
    }
}

impl Configuration {
    /// Set the per-stream receive window.
    pub fn with_stream_receive_window(mut self, window: usize) -> Self {
        self.stream_receive_window = window;
        self
    }

    /// Set the number of outbound message buffers.
    pub fn with_write_buffer_count(mut self, count: usize) -> Self {
        self.write_buffer_count = count;
        self
    }

    /// Set the accept backlog depth.
    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    /// Set the heartbeat transmission interval (zero disables).
    pub fn with_heartbeat_transmit_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_transmit_interval = interval;
        self
    }

    /// Set the maximum heartbeat receive interval (zero disables).
    pub fn with_maximum_heartbeat_receive_interval(mut self, interval: Duration) -> Self {
        self.maximum_heartbeat_receive_interval = interval;
        self
    }

    /// Clamp values that cannot work to their smallest usable setting.
    pub fn normalize(&mut self) {
        self.stream_receive_window = self.stream_receive_window.max(1);
        self.write_buffer_count = self.write_buffer_count.max(1);
        self.accept_backlog = self.accept_backlog.max(1);
    }

    /// Normalised copy.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}
