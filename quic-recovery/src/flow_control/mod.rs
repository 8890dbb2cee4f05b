//! Stream and connection flow control (RFC 9000 §4)
//!
//! Both levels share [`WindowAccounting`]. A [`StreamFlowController`] holds
//! the connection's controller through the narrow [`ConnectionFlowControl`]
//! interface and forwards every received increment and every read byte to it.
//! Each controller locks only its own state; a stream controller releases its
//! lock before calling into the connection.

pub mod base;
pub mod connection;
pub mod stream;

pub use base::WindowAccounting;
pub use connection::ConnectionFlowController;
pub use stream::StreamFlowController;

use crate::error::TransportError;
use std::sync::Arc;
use std::time::Instant;

/// Decides whether a receive window may grow by the given number of bytes
pub type WindowIncreasePolicy = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Operations a stream controller needs from the connection controller
pub trait ConnectionFlowControl: Send + Sync {
    /// Account bytes newly received on some stream
    fn increment_highest_received(&self, increment: u64, now: Instant) -> Result<(), TransportError>;

    /// Account bytes read from some stream; returns true if a MAX_DATA update is due
    fn add_bytes_read(&self, n: u64) -> bool;

    fn add_bytes_sent(&self, n: u64);

    fn send_window_size(&self) -> u64;

    /// Keep the connection window at least `size` bytes
    fn ensure_minimum_window_size(&self, size: u64, now: Instant);
}

/// Window updates due after a read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUpdates {
    /// MAX_STREAM_DATA
    pub stream: bool,
    /// MAX_DATA
    pub connection: bool,
}
