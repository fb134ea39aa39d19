//! Host-side capabilities: port enumeration, opening links and waiting.
//!
//! The board resets asynchronously after a bootloader trigger and after a
//! flash write. Instead of sleeping for a fixed time, callers poll the
//! port list until the expected change is observed, with a doubling
//! interval and an overall timeout. All waiting goes through
//! [`DeviceBus::sleep`], so a simulated bus runs without real delays.

use crate::device::{BoardIdentity, BoardPort, locate_board, matching_ports};
use crate::error::{Error, Result};
use crate::port::{Port, PortInfo, SerialConfig};
use log::{debug, trace};
use std::time::Duration;

/// Access to the host's serial ports.
pub trait DeviceBus {
    /// Enumerate visible serial ports.
    fn list_ports(&mut self) -> Result<Vec<PortInfo>>;

    /// Open a link. The link is closed when the returned port is dropped.
    fn open(&mut self, config: &SerialConfig) -> Result<Box<dyn Port>>;

    /// Block the current thread.
    fn sleep(&mut self, duration: Duration);
}

impl<B: DeviceBus + ?Sized> DeviceBus for &mut B {
    fn list_ports(&mut self) -> Result<Vec<PortInfo>> {
        (**self).list_ports()
    }

    fn open(&mut self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        (**self).open(config)
    }

    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// The real host bus, backed by `serialport`.
#[cfg(feature = "native")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBus;

#[cfg(feature = "native")]
impl DeviceBus for NativeBus {
    fn list_ports(&mut self) -> Result<Vec<PortInfo>> {
        crate::port::list_ports()
    }

    fn open(&mut self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        Ok(Box::new(crate::port::NativePort::open(config)?))
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Longest interval between two polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// First interval; doubles after every miss up to [`MAX_POLL_INTERVAL`].
    pub interval: Duration,
    /// Give up once this much time has been spent waiting.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Create a policy.
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Poll the port list until `check` returns `Some`.
    ///
    /// Enumeration errors count as an empty list; the board is mid-reset
    /// often enough that a transient failure is expected.
    pub fn poll<B, T, F>(&self, bus: &mut B, what: &str, mut check: F) -> Result<T>
    where
        B: DeviceBus + ?Sized,
        F: FnMut(&[PortInfo]) -> Option<T>,
    {
        let mut waited = Duration::ZERO;
        let mut interval = self
            .interval
            .max(Duration::from_millis(1));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ports = bus
                .list_ports()
                .unwrap_or_else(|e| {
                    debug!("Port enumeration failed: {e}");
                    Vec::new()
                });
            if let Some(found) = check(&ports) {
                trace!("{what}: ready after {attempt} poll(s)");
                return Ok(found);
            }

            if waited >= self.timeout {
                return Err(Error::BootTimeout {
                    what: what.to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            let step = interval.min(self.timeout - waited);
            debug!("{what}: not ready (attempt {attempt}), retrying in {step:?}");
            bus.sleep(step);
            waited += step;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

/// Wait until `board` is no longer enumerated.
pub fn wait_for_departure<B: DeviceBus + ?Sized>(
    bus: &mut B,
    board: &BoardPort,
    policy: &PollPolicy,
) -> Result<()> {
    policy.poll(bus, "board to leave application mode", |ports| {
        (!ports.iter().any(|p| board.is(p))).then_some(())
    })
}

/// Wait until the pinned board is enumerated again and return its
/// current port.
///
/// A board pinned by path only may come back under another path. It is
/// then followed to the port matching `identity`, as long as exactly one
/// port does.
pub fn wait_for_board<B: DeviceBus + ?Sized>(
    bus: &mut B,
    identity: &BoardIdentity,
    board: &BoardPort,
    policy: &PollPolicy,
) -> Result<BoardPort> {
    policy.poll(bus, "board to boot", |ports| {
        locate_board(ports, identity, Some(board))
            .or_else(|| {
                if board.usb_serial.is_some() {
                    return None;
                }
                match matching_ports(ports, identity).as_slice() {
                    [only] => {
                        debug!("{} not seen again, following board to {}", board.path, only.name);
                        Some(*only)
                    },
                    _ => None,
                }
            })
            .map(BoardPort::from_info)
    })
}
