//! Board discovery.
//!
//! The board enumerates as a USB CDC serial port in application mode and
//! disappears from the serial port list while in bootloader (DFU) mode. A
//! port is recognised by substrings of its USB product and manufacturer
//! strings; once found, a run pins the board by its USB serial number so
//! re-enumeration under a different path still resolves to the same unit.

use crate::error::{Error, Result};
use crate::port::PortInfo;
use log::{debug, trace};

/// Descriptive strings identifying the target board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    /// Substring of the USB product string.
    pub product: String,
    /// Substring of the USB manufacturer string.
    pub manufacturer: String,
}

impl Default for BoardIdentity {
    fn default() -> Self {
        Self {
            product: "Giga".to_string(),
            manufacturer: "Arduino".to_string(),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_lowercase()
        .contains(&needle.to_lowercase())
}

impl BoardIdentity {
    /// Create an identity from product and manufacturer substrings.
    pub fn new(product: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            manufacturer: manufacturer.into(),
        }
    }

    /// Whether a port's metadata matches this board. Both strings must be
    /// present; matching ignores case.
    pub fn matches(&self, port: &PortInfo) -> bool {
        let (Some(product), Some(manufacturer)) = (&port.product, &port.manufacturer) else {
            return false;
        };
        contains_ignore_case(product, &self.product)
            && contains_ignore_case(manufacturer, &self.manufacturer)
    }
}

/// A board pinned for the duration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BoardPort {
    /// Current port path.
    pub path: String,
    /// USB serial number, used to re-identify the board after resets.
    pub usb_serial: Option<String>,
}

impl BoardPort {
    /// Pin a board from its enumerated port.
    pub fn from_info(info: &PortInfo) -> Self {
        Self {
            path: info.name.clone(),
            usb_serial: info.serial_number.clone(),
        }
    }

    /// Pin a board by path only.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            usb_serial: None,
        }
    }

    /// Whether `info` is this board.
    ///
    /// With a known USB serial number the match is by serial number only,
    /// since the path may change across re-enumeration. Without one, the
    /// path must match.
    pub fn is(&self, info: &PortInfo) -> bool {
        match (&self.usb_serial, &info.serial_number) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => self.path == info.name,
        }
    }
}

/// All ports matching the board identity.
pub fn matching_ports<'a>(ports: &'a [PortInfo], identity: &BoardIdentity) -> Vec<&'a PortInfo> {
    ports
        .iter()
        .filter(|p| {
            let hit = identity.matches(p);
            trace!("{}: {}", p.name, if hit { "match" } else { "no match" });
            hit
        })
        .collect()
}

/// Find the board among `ports`.
///
/// When `pinned` is given only that board is accepted; otherwise the first
/// port matching `identity` is returned.
pub fn locate_board<'a>(
    ports: &'a [PortInfo],
    identity: &BoardIdentity,
    pinned: Option<&BoardPort>,
) -> Option<&'a PortInfo> {
    let found = match pinned {
        Some(board) => ports.iter().find(|p| board.is(p)),
        None => matching_ports(ports, identity)
            .into_iter()
            .next(),
    };
    if let Some(port) = found {
        debug!("Board located on {}", port.name);
    }
    found
}

/// Like [`locate_board`] but fails with `DeviceNotFound`.
pub fn require_board(
    ports: &[PortInfo],
    identity: &BoardIdentity,
    pinned: Option<&BoardPort>,
) -> Result<BoardPort> {
    locate_board(ports, identity, pinned)
        .map(BoardPort::from_info)
        .ok_or_else(|| {
            Error::DeviceNotFound(format!(
                "no port with product '{}' and manufacturer '{}' among {} visible port(s)",
                identity.product,
                identity.manufacturer,
                ports.len()
            ))
        })
}

/// Format a list of ports for display, marking board matches.
pub fn format_port_list(ports: &[PortInfo], identity: &BoardIdentity) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let marker = if identity.matches(port) { " [board]" } else { "" };
            let ids = match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
                _ => String::new(),
            };
            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{marker}{ids}{product}", port.name)
        })
        .collect()
}
