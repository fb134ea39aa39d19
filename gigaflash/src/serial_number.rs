//! Canonical serial numbers.
//!
//! Operators type a short token (`7`, `42`, `A1B`); the firmware and the
//! validation handshake carry the canonical form `DA_2025_007`.

use crate::error::{Error, Result};
use crate::image::SERIAL_FIELD_LEN;
use std::fmt;
use std::str::FromStr;

/// Prefix of every canonical serial number.
pub const SERIAL_PREFIX: &str = "DA_2025_";

/// Width of the suffix after the prefix.
pub const SUFFIX_LEN: usize = 3;

const _: () = assert!(SERIAL_PREFIX.len() + SUFFIX_LEN <= SERIAL_FIELD_LEN);

/// A canonical serial number, always `DA_2025_` followed by three
/// ASCII alphanumeric characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Build the canonical form from an operator token of 1 to 3
    /// alphanumeric characters, left-padding with `0`.
    pub fn from_token(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidSerial("token is empty".to_string()));
        }
        if token.len() > SUFFIX_LEN {
            return Err(Error::InvalidSerial(format!(
                "'{token}' is longer than {SUFFIX_LEN} characters"
            )));
        }
        if !token.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidSerial(format!(
                "'{token}' must contain only ASCII letters and digits"
            )));
        }
        Ok(Self(format!("{SERIAL_PREFIX}{token:0>SUFFIX_LEN$}")))
    }

    /// Accept either a full canonical value or a short token.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match input.strip_prefix(SERIAL_PREFIX) {
            Some(suffix) if suffix.len() == SUFFIX_LEN => Self::from_token(suffix),
            Some(_) => Err(Error::InvalidSerial(format!(
                "'{input}' must be {SERIAL_PREFIX} followed by {SUFFIX_LEN} characters"
            ))),
            None => Self::from_token(input),
        }
    }

    /// The canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The three-character suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.0[SERIAL_PREFIX.len()..]
    }
}

impl FromStr for SerialNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SerialNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
