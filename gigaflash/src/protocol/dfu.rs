//! Bootloader entry via the 1200-baud "touch".
//!
//! Opening the application-mode CDC port at 1200 baud and closing it again
//! tells the board's USB stack to reset into its DFU bootloader. Nothing
//! is exchanged on the wire and nothing is acknowledged; the only
//! observable effect is the serial port disappearing while the board
//! re-enumerates as a DFU device.

use crate::bus::{DeviceBus, PollPolicy, wait_for_departure};
use crate::device::BoardPort;
use crate::error::{Error, Result};
use crate::port::{SerialConfig, TOUCH_BAUD};
use log::{info, warn};
use std::time::Duration;

/// Read/write timeout for the touch session.
const TOUCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Send the 1200-baud touch to `port`.
///
/// Fire-and-forget: success only means the port could be opened and closed.
pub fn trigger_bootloader<B: DeviceBus + ?Sized>(bus: &mut B, port: &str) -> Result<()> {
    let config = SerialConfig::new(port, TOUCH_BAUD).with_timeout(TOUCH_TIMEOUT);
    let mut link = bus
        .open(&config)
        .map_err(|e| Error::BootloaderEntryFailed {
            port: port.to_string(),
            reason: e.to_string(),
        })?;
    if let Err(e) = link.close() {
        warn!("Closing {port} after bootloader touch: {e}");
    }
    info!("Triggered bootloader mode on {port}");
    Ok(())
}

/// Trigger bootloader mode and wait for the board to re-enumerate.
///
/// Waits until the application-mode port disappears, then for `settle`
/// so the DFU interface is ready. If the port never disappears the wait
/// gives up with a warning and the flash tool reports the real failure.
pub fn enter_bootloader<B: DeviceBus + ?Sized>(
    bus: &mut B,
    board: &BoardPort,
    policy: &PollPolicy,
    settle: Duration,
) -> Result<()> {
    trigger_bootloader(bus, &board.path)?;

    match wait_for_departure(bus, board, policy) {
        Ok(()) => {},
        Err(Error::BootTimeout { waited_ms, .. }) => {
            warn!(
                "{} still enumerated {waited_ms} ms after bootloader touch, continuing",
                board.path
            );
        },
        Err(e) => return Err(e),
    }

    if !settle.is_zero() {
        bus.sleep(settle);
    }
    Ok(())
}
