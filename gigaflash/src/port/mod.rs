//! Port abstraction for serial links.
//!
//! Every phase that talks to the board (bootloader trigger, validation)
//! opens its own link, owns it exclusively and closes it before the next
//! phase starts. Links are closed on drop, so early returns and `?` release
//! the port as well.
//!
//! ```text
//! +------------------+     +------------------+
//! |   DfuTrigger     |     | ValidationProbe  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |                Port trait                 |
//! +--------+------------------------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | NativePort       |     | MockPort (tests) |
//! |  (serialport)    |     |                  |
//! +------------------+     +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate the board's bootloader-entry logic watches for.
pub const TOUCH_BAUD: u32 = 1200;

/// Baud rate of the application firmware's command interface.
pub const APP_BAUD: u32 = 115_200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: APP_BAUD,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// USB serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativePort, list_ports};
