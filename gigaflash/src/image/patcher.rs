//! Locating and rewriting the serial-number field.

use super::{SERIAL_FIELD_LEN, SERIAL_MARKER, SERIAL_REGION_LEN};
use crate::error::{Error, Result};
use log::{debug, info};

/// The serial field as found in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialField {
    /// Offset of the marker's first byte.
    pub offset: usize,
    /// Decoded value with trailing NUL bytes stripped.
    pub value: String,
}

impl SerialField {
    /// Offset of the first value byte.
    #[must_use]
    pub fn value_offset(&self) -> usize {
        self.offset + SERIAL_MARKER.len()
    }

    /// Marker followed by the value, NUL-padded to the full region width.
    fn region_bytes(value: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SERIAL_REGION_LEN);
        bytes.extend_from_slice(SERIAL_MARKER);
        bytes.extend_from_slice(value.as_bytes());
        bytes.resize(SERIAL_REGION_LEN, 0);
        bytes
    }
}

/// Result of a successful patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Field before patching.
    pub previous: SerialField,
    /// Value now stored in the field.
    pub value: String,
}

impl PatchOutcome {
    /// Whether the patch left the bytes unchanged.
    #[must_use]
    pub fn unchanged(&self) -> bool {
        self.previous.value == self.value
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Find the serial field and decode its current value.
pub fn locate(data: &[u8]) -> Result<SerialField> {
    let offset = find(data, SERIAL_MARKER).ok_or(Error::MarkerNotFound)?;
    let start = offset + SERIAL_MARKER.len();
    let available = data.len() - start;
    if available < SERIAL_FIELD_LEN {
        return Err(Error::FieldTruncated {
            offset,
            available,
            required: SERIAL_FIELD_LEN,
        });
    }

    let raw = &data[start..start + SERIAL_FIELD_LEN];
    let trimmed_len = raw
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    let raw = &raw[..trimmed_len];
    if !raw.is_ascii() {
        return Err(Error::FieldNotAscii { offset });
    }

    let value = String::from_utf8_lossy(raw).into_owned();
    debug!("Serial field at 0x{offset:08X}: '{value}'");
    Ok(SerialField { offset, value })
}

fn check_value(new_value: &str) -> Result<()> {
    if !new_value.is_ascii() {
        return Err(Error::InvalidSerial(format!("'{new_value}' is not ASCII")));
    }
    if new_value.len() > SERIAL_FIELD_LEN {
        return Err(Error::SerialTooLong {
            value: new_value.to_string(),
            len: new_value.len(),
            max: SERIAL_FIELD_LEN,
        });
    }
    Ok(())
}

/// Replace the serial value inside `data`.
///
/// Every check runs before the first byte is written, so `data` is
/// unmodified on error.
pub fn patch_in_place(data: &mut [u8], new_value: &str) -> Result<PatchOutcome> {
    check_value(new_value)?;
    let previous = locate(data)?;

    let old_region = SerialField::region_bytes(&previous.value);
    let range = previous.offset..previous.offset + SERIAL_REGION_LEN;
    // Re-encoding the decoded value reproduces the region for every field
    // `locate` accepts, including interior NULs, so this only trips if the
    // two ever disagree.
    if data[range.clone()] != old_region[..] {
        return Err(Error::FieldMismatch {
            offset: previous.offset,
            value: previous.value,
        });
    }

    let new_region = SerialField::region_bytes(new_value);
    data[range].copy_from_slice(&new_region);

    info!(
        "Serial number '{}' -> '{}' at 0x{:08X}",
        previous.value, new_value, previous.offset
    );
    Ok(PatchOutcome {
        previous,
        value: new_value.to_string(),
    })
}

/// Return a patched copy of `data`.
pub fn patch(data: &[u8], new_value: &str) -> Result<Vec<u8>> {
    let mut out = data.to_vec();
    patch_in_place(&mut out, new_value)?;
    Ok(out)
}
