//! Post-flash validation handshake.
//!
//! The application firmware exposes a line protocol on its CDC port:
//! each CRLF-terminated command is answered by exactly one line.
//!
//! | Command         | Response                          |
//! |-----------------|-----------------------------------|
//! | `NOP`           | `NOP`                             |
//! | `*IDN?`         | free-form identity string         |
//! | `SERIAL_NUMBER` | canonical serial number in flash  |

use crate::bus::DeviceBus;
use crate::error::{Error, Result};
use crate::port::{APP_BAUD, Port, SerialConfig};
use log::{debug, info, trace, warn};
use std::io::ErrorKind;
use std::time::Duration;

/// Per-line read timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness command; echoed verbatim.
pub const CMD_NOP: &str = "NOP";

/// Identity query.
pub const CMD_IDN: &str = "*IDN?";

/// Serial number query.
pub const CMD_SERIAL: &str = "SERIAL_NUMBER";

/// Longest response line accepted.
const MAX_LINE_LEN: usize = 256;

/// What the device reported during a passing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceIdentity {
    /// Response to `*IDN?`.
    pub idn: String,
    /// Response to `SERIAL_NUMBER`.
    pub serial: String,
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "result", rename_all = "snake_case"))]
pub enum Verdict {
    /// `NOP` echoed and the serial number matched.
    Pass(DeviceIdentity),
    /// The device reported a different serial number.
    Mismatch {
        /// Serial number expected.
        expected: String,
        /// Serial number reported.
        actual: String,
        /// Response to `*IDN?`.
        idn: String,
    },
    /// A command was answered with something other than its expected reply.
    /// No further commands were sent.
    UnexpectedResponse {
        /// Command that was sent.
        command: String,
        /// Line received.
        response: String,
    },
}

impl Verdict {
    /// Whether the device passed.
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    /// Convert a non-passing verdict into `ValidationMismatch`.
    pub fn into_result(self) -> Result<DeviceIdentity> {
        match self {
            Self::Pass(identity) => Ok(identity),
            Self::Mismatch {
                expected, actual, ..
            } => Err(Error::ValidationMismatch { expected, actual }),
            Self::UnexpectedResponse { command, response } => Err(Error::ValidationMismatch {
                expected: command,
                actual: response,
            }),
        }
    }
}

/// Runs the handshake over an open link.
pub struct ValidationProbe<P: Port> {
    port: P,
    rx: Vec<u8>,
}

impl<P: Port> ValidationProbe<P> {
    /// Wrap an open link.
    pub fn new(port: P) -> Self {
        Self {
            port,
            rx: Vec::new(),
        }
    }

    /// Consume the probe and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Run the handshake.
    ///
    /// With `expected` set, passes only if the reported serial number is
    /// byte-for-byte equal. Without it, passes on a correct `NOP` echo and
    /// reports the serial number as read.
    pub fn run(&mut self, expected: Option<&str>) -> Result<Verdict> {
        self.port
            .clear_buffers()
            .map_err(|e| Error::ProbeError(format!("clearing buffers: {e}")))?;

        let echo = self.command(CMD_NOP)?;
        if echo != CMD_NOP {
            warn!("NOP answered with '{echo}'");
            return Ok(Verdict::UnexpectedResponse {
                command: CMD_NOP.to_string(),
                response: echo,
            });
        }
        debug!("NOP echoed");

        let idn = self.command(CMD_IDN)?;
        let serial = self.command(CMD_SERIAL)?;
        info!("Device identity: '{idn}', serial number: '{serial}'");

        match expected {
            Some(expected) if serial != expected => Ok(Verdict::Mismatch {
                expected: expected.to_string(),
                actual: serial,
                idn,
            }),
            _ => Ok(Verdict::Pass(DeviceIdentity { idn, serial })),
        }
    }

    /// Run the handshake expecting `expected_serial`.
    pub fn validate(&mut self, expected_serial: &str) -> Result<Verdict> {
        self.run(Some(expected_serial))
    }

    fn command(&mut self, command: &str) -> Result<String> {
        trace!("> {command}");
        self.port
            .write_all_bytes(format!("{command}\r\n").as_bytes())
            .map_err(|e| Error::ProbeError(format!("sending {command}: {e}")))?;
        let line = self.read_line(command)?;
        trace!("< {line}");
        Ok(line)
    }

    fn read_line(&mut self, command: &str) -> Result<String> {
        loop {
            if let Some(end) = self
                .rx
                .iter()
                .position(|&b| b == b'\n')
            {
                let raw: Vec<u8> = self
                    .rx
                    .drain(..=end)
                    .collect();
                let line = String::from_utf8(raw).map_err(|_| {
                    Error::ProbeError(format!("response to {command} is not valid UTF-8"))
                })?;
                return Ok(line.trim().to_string());
            }
            if self.rx.len() > MAX_LINE_LEN {
                return Err(Error::ProbeError(format!(
                    "response to {command} exceeds {MAX_LINE_LEN} bytes"
                )));
            }

            let mut buf = [0u8; 64];
            match self.port.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::ProbeError(format!(
                        "link closed while waiting for response to {command}"
                    )));
                },
                Ok(n) => self
                    .rx
                    .extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(Error::ProbeError(format!(
                        "no response to {command} within {:?}",
                        self.port.timeout()
                    )));
                },
                Err(e) => {
                    return Err(Error::ProbeError(format!(
                        "reading response to {command}: {e}"
                    )));
                },
            }
        }
    }
}

/// Open `port` at the application baud rate and run the handshake.
///
/// The link is closed before returning, on every path.
pub fn validate<B: DeviceBus + ?Sized>(
    bus: &mut B,
    port: &str,
    expected: Option<&str>,
) -> Result<Verdict> {
    let config = SerialConfig::new(port, APP_BAUD).with_timeout(PROBE_TIMEOUT);
    let link = bus
        .open(&config)
        .map_err(|e| Error::ProbeError(format!("opening {port}: {e}")))?;

    info!("Validating firmware on {port}");
    let mut probe = ValidationProbe::new(link);
    let verdict = probe.run(expected);

    let mut link = probe.into_port();
    if let Err(e) = link.close() {
        warn!("Closing {port}: {e}");
    }
    verdict
}
