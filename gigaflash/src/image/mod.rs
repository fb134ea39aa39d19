//! Firmware images and the embedded serial-number field.
//!
//! Secondary-core images reserve 29 bytes for the unit serial number:
//!
//! ```text
//! +-----------------------------+------------------------------+
//! | "__SERIAL_NUMBER__" (17 B)  | ASCII value, NUL-padded (12) |
//! +-----------------------------+------------------------------+
//! ```
//!
//! The offset differs between builds, so the field is always found by
//! searching for the marker. Only the first occurrence counts.

mod patcher;

pub use patcher::{PatchOutcome, SerialField, locate, patch, patch_in_place};

use crate::error::{Error, Result};
use log::debug;
use std::fs;
use std::path::Path;

/// Marker preceding the serial-number field.
pub const SERIAL_MARKER: &[u8] = b"__SERIAL_NUMBER__";

/// Width of the serial-number value, including NUL padding.
pub const SERIAL_FIELD_LEN: usize = 12;

/// Total reserved region: marker plus value.
pub const SERIAL_REGION_LEN: usize = SERIAL_MARKER.len() + SERIAL_FIELD_LEN;

/// An owned firmware image.
///
/// The length of the buffer never changes once loaded; patching only
/// rewrites bytes inside the serial field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Wrap raw bytes.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Load an image from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| Error::FirmwareFile {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Ok(Self { data })
    }

    /// Write the image to disk.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, &self.data).map_err(|source| Error::FirmwareFile {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Wrote {} ({} bytes)", path.display(), self.data.len());
        Ok(())
    }

    /// Image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the image and return its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Image length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the serial field.
    pub fn serial_field(&self) -> Result<SerialField> {
        locate(&self.data)
    }

    /// Replace the serial value. On error the image is left untouched.
    pub fn patch_serial(&mut self, new_value: &str) -> Result<PatchOutcome> {
        patch_in_place(&mut self.data, new_value)
    }
}

impl From<Vec<u8>> for FirmwareImage {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_len() {
        assert_eq!(SERIAL_MARKER.len(), 17);
        assert_eq!(SERIAL_REGION_LEN, 29);
    }

    #[test]
    fn test_file_roundtrip_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");

        let mut bytes = vec![0xAA; 8];
        bytes.extend_from_slice(b"__SERIAL_NUMBER__DA_2025_001\0");
        bytes.extend_from_slice(&[0x55; 8]);
        fs::write(&path, &bytes).unwrap();

        let mut image = FirmwareImage::from_file(&path).unwrap();
        image.patch_serial("DA_2025_042").unwrap();
        image.write_to(&path).unwrap();

        let reloaded = FirmwareImage::from_file(&path).unwrap();
        assert_eq!(reloaded.len(), bytes.len());
        assert_eq!(reloaded.serial_field().unwrap().value, "DA_2025_042");
    }

    #[test]
    fn test_from_file_missing() {
        let err = FirmwareImage::from_file("/nonexistent/firmwareM4.bin").unwrap_err();
        match err {
            Error::FirmwareFile { path, .. } => assert!(path.ends_with("firmwareM4.bin")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
