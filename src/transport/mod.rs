//! Byte-stream transports to physical FPGA devices.
//!
//! The wire itself is assumed reliable and is deliberately thin: a device is
//! something we can write whole frames to and read whole frames from with a
//! bounded wait. Device discovery, firmware upload, and the meaning of the
//! bytes all live elsewhere.
//!
//! [`bus`] provides the arbitration layer for physical devices that host more
//! than one logical compute unit on a single transport.

pub mod bus;
pub mod serial;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("short write: {wrote} of {wanted} bytes")]
    ShortWrite { wanted: usize, wrote: usize },

    #[error("link is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A reliable byte-stream link to a physical device.
///
/// Reads and writes move raw frame bytes; framing and interpretation belong
/// to the protocol layer. Implementations must not buffer partial writes
/// silently: the returned count is the number of bytes actually accepted.
#[async_trait]
pub trait Transport: Send {
    /// Write the buffer, returning the number of bytes accepted.
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `wait`.
    ///
    /// Returns 0 when no data arrived within the wait (not an error). A
    /// partial frame is a legal return; callers decide what a short read
    /// means.
    async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError>;
}
