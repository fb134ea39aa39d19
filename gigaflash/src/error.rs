//! Error types for gigaflash.

use crate::orchestrator::Step;
use crate::target::Core;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for gigaflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gigaflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A firmware file could not be read or written.
    #[error("Firmware file {}: {source}", path.display())]
    FirmwareFile {
        /// File that was accessed.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// No serial port matched the board identity.
    #[error("Board not found: {0}")]
    DeviceNotFound(String),

    /// The 1200-baud bootloader trigger could not be delivered.
    #[error("Failed to enter bootloader on {port}: {reason}")]
    BootloaderEntryFailed {
        /// Port the trigger was sent to.
        port: String,
        /// Underlying failure.
        reason: String,
    },

    /// The flash tool exited with a failure while writing a core's region.
    #[error("Flash write to {core} core failed: {detail}")]
    FlashWriteFailed {
        /// Core whose region was being written.
        core: Core,
        /// Exit status and tool output.
        detail: String,
    },

    /// The flash tool exited with a failure while reading a core's region.
    #[error("Flash read from {core} core failed: {detail}")]
    FlashReadFailed {
        /// Core whose region was being read.
        core: Core,
        /// Exit status and tool output.
        detail: String,
    },

    /// The serial marker does not occur in the firmware image.
    #[error("Serial number marker not found in firmware image")]
    MarkerNotFound,

    /// The marker sits too close to the end of the image to hold a full field.
    #[error("Serial field at offset {offset:#x} is truncated ({available} of {required} bytes)")]
    FieldTruncated {
        /// Offset of the marker.
        offset: usize,
        /// Bytes available after the marker.
        available: usize,
        /// Bytes the field requires.
        required: usize,
    },

    /// The serial field contains bytes that are not ASCII.
    #[error("Serial field at offset {offset:#x} is not ASCII")]
    FieldNotAscii {
        /// Offset of the marker.
        offset: usize,
    },

    /// The re-derived marker+field bytes are not present in the image.
    #[error("Serial field at offset {offset:#x} does not match its decoded value '{value}'")]
    FieldMismatch {
        /// Offset of the marker.
        offset: usize,
        /// Decoded value the field was expected to hold.
        value: String,
    },

    /// The new serial value does not fit in the fixed-width field.
    #[error("Serial number '{value}' is {len} bytes, field holds at most {max}")]
    SerialTooLong {
        /// Rejected value.
        value: String,
        /// Encoded length of the value.
        len: usize,
        /// Field width.
        max: usize,
    },

    /// Operator token or canonical serial number is malformed.
    #[error("Invalid serial number: {0}")]
    InvalidSerial(String),

    /// I/O failure or timeout during the validation exchange.
    #[error("Validation probe failed: {0}")]
    ProbeError(String),

    /// The device answered but not with the expected content.
    #[error("Validation mismatch: expected '{expected}', device reported '{actual}'")]
    ValidationMismatch {
        /// Expected response.
        expected: String,
        /// Response observed on the wire.
        actual: String,
    },

    /// Bounded polling gave up waiting for the board.
    #[error("Timed out after {waited_ms} ms waiting for {what}")]
    BootTimeout {
        /// What was being waited for.
        what: String,
        /// Total time spent polling.
        waited_ms: u64,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A flashing step failed; carries the phase name.
    #[error("{step} failed: {source}")]
    Step {
        /// Step that was running.
        step: Step,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Strip any step context and return the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Step the error was raised in, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Attach step context.
    pub(crate) fn at(self, step: Step) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }
}
