//! Serial UART transport.
//!
//! FPGA boards in the serial class present a plain UART (usually behind an
//! FTDI or CDC-ACM bridge) running at a fixed baud rate. One open port is one
//! physical device; multi-slot boards multiplex logical units behind the same
//! port.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Transport, TransportError};
use crate::tracing::prelude::*;

/// The serial I/O speed all supported boards run at.
pub const SERIAL_IO_SPEED: u32 = 115_200;

/// An open serial link to one physical device.
pub struct SerialLink {
    path: String,
    port: SerialStream,
}

impl SerialLink {
    /// Open the port at `path` at the fixed device baud rate.
    pub async fn open(path: &str) -> Result<Self, TransportError> {
        let port = tokio_serial::new(path, SERIAL_IO_SPEED)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        trace!(path, baud = SERIAL_IO_SPEED, "serial port open");
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Transport for SerialLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let n = self.port.write(bytes).await?;
        self.port.flush().await?;
        Ok(n)
    }

    async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
        match tokio::time::timeout(wait, self.port.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Ok(0),
        }
    }
}
