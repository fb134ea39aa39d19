//! Serial-side protocols spoken with the board.
//!
//! - [`dfu`]: the 1200-baud touch that resets the board into its bootloader.
//! - [`probe`]: the line-based validation handshake of the application firmware.

pub mod dfu;
pub mod probe;

pub use dfu::{enter_bootloader, trigger_bootloader};
pub use probe::{DeviceIdentity, ValidationProbe, Verdict};
