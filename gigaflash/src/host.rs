//! Host-side utilities for serial port discovery.

use crate::port::PortInfo;

/// Discover all available serial ports.
pub fn discover_ports() -> crate::Result<Vec<PortInfo>> {
    crate::port::list_ports()
}
