//! # gigaflash
//!
//! Provisioning for two-core Arduino GIGA boards: serial-number patching,
//! DFU flashing of both cores and post-flash validation.
//!
//! The crate covers:
//!
//! - locating the board among the host's serial ports
//! - patching the fixed-width serial field of a secondary-core image
//! - the 1200-baud bootloader touch
//! - writing both cores through `dfu-util`, with bounded polling for
//!   re-enumeration in between
//! - the `NOP` / `*IDN?` / `SERIAL_NUMBER` validation handshake
//!
//! ## Features
//!
//! - `native` (default): host serial ports via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use gigaflash::{DeviceTarget, DfuUtil, FlashOrchestrator, FlashPlan, NativeBus, SerialNumber};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let serial = SerialNumber::from_token("42")?;
//!     let plan = FlashPlan::prepare(Path::new("firmware"), DeviceTarget::NewHardware, Some(serial))?;
//!
//!     let tool = DfuUtil::new(DfuUtil::default_staging());
//!     let mut orchestrator = FlashOrchestrator::new(NativeBus, tool);
//!     let report = orchestrator.run(&plan, None, &mut |step| println!("{step}"))?;
//!
//!     if !report.validated() {
//!         eprintln!("flashed, but validation did not pass");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod device;
pub mod error;
#[cfg(feature = "native")]
pub mod host;
pub mod image;
pub mod orchestrator;
pub mod port;
pub mod protocol;
pub mod serial_number;
pub mod target;
pub mod tool;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use bus::NativeBus;
#[cfg(feature = "native")]
pub use host::discover_ports;
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    bus::{DeviceBus, PollPolicy},
    device::{BoardIdentity, BoardPort, format_port_list, locate_board, matching_ports},
    error::{Error, Result},
    image::{FirmwareImage, PatchOutcome, SerialField},
    orchestrator::{FlashOrchestrator, FlashPlan, RunReport, Step, Timing},
    port::{Port, PortInfo, SerialConfig},
    protocol::{DeviceIdentity, ValidationProbe, Verdict},
    serial_number::SerialNumber,
    target::{Core, DeviceTarget, FlashRegion},
    tool::{DfuUtil, FlashTool},
};
