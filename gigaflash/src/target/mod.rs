//! Board layout: the two cores, their flash regions and the hardware variants.
//!
//! The GIGA carries a Cortex-M7 (primary core) and a Cortex-M4 (secondary
//! core). Each core boots from its own flash region, and bootloader mode
//! only accepts writes to one region per trigger cycle.

use std::fmt;
use std::path::{Path, PathBuf};

/// DFU alternate setting exposing internal flash.
pub const DFU_ALT_SETTING: u8 = 0;

/// Primary-core firmware file name, shared by every variant.
pub const PRIMARY_FIRMWARE: &str = "firmwareM7.bin";

/// One of the two processing cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Core {
    /// Cortex-M7.
    Primary,
    /// Cortex-M4, carries the serial number field.
    Secondary,
}

impl Core {
    /// Flash region this core boots from.
    #[must_use]
    pub fn region(self) -> FlashRegion {
        match self {
            Self::Primary => FlashRegion::PRIMARY,
            Self::Secondary => FlashRegion::SECONDARY,
        }
    }
}

impl fmt::Display for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary (M7)"),
            Self::Secondary => write!(f, "secondary (M4)"),
        }
    }
}

/// A hard-coded flash region addressed by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashRegion {
    /// Start address in the device memory map.
    pub address: u32,
}

impl FlashRegion {
    /// Primary-core image base.
    pub const PRIMARY: Self = Self {
        address: 0x0804_0000,
    };

    /// Secondary-core image base.
    pub const SECONDARY: Self = Self {
        address: 0x0810_0000,
    };

    /// `dfu-util -s` argument for writing and leaving bootloader mode.
    #[must_use]
    pub fn write_spec(&self) -> String {
        format!("0x{:08X}:leave", self.address)
    }

    /// `dfu-util -s` argument for reading the region.
    #[must_use]
    pub fn read_spec(&self) -> String {
        format!("0x{:08X}:", self.address)
    }
}

impl fmt::Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.address)
    }
}

/// Supported hardware variants.
///
/// Variants differ only in the secondary-core firmware; the primary image
/// is the same for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceTarget {
    /// Current production hardware.
    #[default]
    NewHardware,
    /// First hardware revision.
    OldHardware,
    /// New shield fitted with the old DAC/ADC stage.
    NewShieldOldDacAdc,
}

impl DeviceTarget {
    /// All variants, in display order.
    pub const ALL: [Self; 3] = [Self::NewHardware, Self::OldHardware, Self::NewShieldOldDacAdc];

    /// Name used on the command line and in firmware file names.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewHardware => "new_hardware",
            Self::OldHardware => "old_hardware",
            Self::NewShieldOldDacAdc => "new_shield_old_dac_adc",
        }
    }

    /// Get the target from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name.trim().to_lowercase())
    }

    /// Secondary-core firmware file name for this variant.
    #[must_use]
    pub fn secondary_firmware(&self) -> String {
        format!("firmwareM4_{}.bin", self.name())
    }

    /// Resolve both firmware paths inside `dir`: `(primary, secondary)`.
    #[must_use]
    pub fn firmware_paths(&self, dir: &Path) -> (PathBuf, PathBuf) {
        (
            dir.join(PRIMARY_FIRMWARE),
            dir.join(self.secondary_firmware()),
        )
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
