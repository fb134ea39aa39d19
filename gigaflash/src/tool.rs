//! Flash-memory access through an external DFU utility.
//!
//! The orchestrator only needs two operations on a core's flash region:
//! write an image (and leave bootloader mode) and read the current image
//! back. [`FlashTool`] is that capability; [`DfuUtil`] implements it by
//! running `dfu-util` as a blocking subprocess whose exit status is the
//! contract.

use crate::error::{Error, Result};
use crate::target::{Core, DFU_ALT_SETTING};
use log::{debug, info, warn};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Output};

/// Default utility name, resolved through `PATH`.
pub const DEFAULT_DFU_UTIL: &str = "dfu-util";

/// Write and read flash regions of a board in bootloader mode.
pub trait FlashTool {
    /// Write `image` to the region of `core`, then leave bootloader mode.
    fn write_image(&mut self, core: Core, image: &[u8]) -> Result<()>;

    /// Read the current contents of the region of `core`. The board stays
    /// in bootloader mode.
    fn read_image(&mut self, core: Core) -> Result<Vec<u8>>;

    /// Remove any intermediate files left by a previous run.
    fn clear_staging(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: FlashTool + ?Sized> FlashTool for &mut T {
    fn write_image(&mut self, core: Core, image: &[u8]) -> Result<()> {
        (**self).write_image(core, image)
    }

    fn read_image(&mut self, core: Core) -> Result<Vec<u8>> {
        (**self).read_image(core)
    }

    fn clear_staging(&mut self) -> Result<()> {
        (**self).clear_staging()
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Host to device (`-D`), leaving bootloader mode afterwards.
    Download,
    /// Device to host (`-U`).
    Upload,
}

/// `dfu-util` subprocess wrapper.
///
/// Images pass through a single staging file, which is reused across runs.
#[derive(Debug, Clone)]
pub struct DfuUtil {
    program: OsString,
    alt: u8,
    staging: PathBuf,
}

impl DfuUtil {
    /// Create a wrapper running `dfu-util` from `PATH`.
    pub fn new(staging: impl Into<PathBuf>) -> Self {
        Self {
            program: OsString::from(DEFAULT_DFU_UTIL),
            alt: DFU_ALT_SETTING,
            staging: staging.into(),
        }
    }

    /// Use a different executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Default staging file inside the system temp directory.
    #[must_use]
    pub fn default_staging() -> PathBuf {
        std::env::temp_dir().join("gigaflash_staging.bin")
    }

    fn args(&self, core: Core, direction: Direction) -> Vec<OsString> {
        let region = core.region();
        let (spec, flag) = match direction {
            Direction::Download => (region.write_spec(), "-D"),
            Direction::Upload => (region.read_spec(), "-U"),
        };
        vec![
            "-a".into(),
            self.alt.to_string().into(),
            "-s".into(),
            spec.into(),
            flag.into(),
            self.staging.clone().into_os_string(),
        ]
    }

    fn run(&self, core: Core, direction: Direction) -> std::result::Result<(), String> {
        let args = self.args(core, direction);
        debug!(
            "Running {} {}",
            self.program.to_string_lossy(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| format!("cannot run {}: {e}", self.program.to_string_lossy()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(describe_failure(&output))
        }
    }

    fn remove_staging(&self) -> Result<()> {
        match fs::remove_file(&self.staging) {
            Ok(()) => {
                debug!("Removed staging file {}", self.staging.display());
                Ok(())
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::FirmwareFile {
                path: self.staging.clone(),
                source,
            }),
        }
    }
}

/// Exit status plus the tail of the utility's diagnostics.
fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let tail: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .rev()
        .take(3)
        .collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();

    if tail.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, tail.join(" | "))
    }
}

impl FlashTool for DfuUtil {
    fn write_image(&mut self, core: Core, image: &[u8]) -> Result<()> {
        fs::write(&self.staging, image).map_err(|source| Error::FirmwareFile {
            path: self.staging.clone(),
            source,
        })?;
        info!(
            "Writing {} bytes to {core} core at {}",
            image.len(),
            core.region()
        );
        self.run(core, Direction::Download)
            .map_err(|detail| Error::FlashWriteFailed { core, detail })
    }

    fn read_image(&mut self, core: Core) -> Result<Vec<u8>> {
        // dfu-util refuses to overwrite an existing upload file.
        self.remove_staging()?;
        info!("Reading {core} core from {}", core.region());
        self.run(core, Direction::Upload)
            .map_err(|detail| Error::FlashReadFailed { core, detail })?;

        fs::read(&self.staging).map_err(|e| Error::FlashReadFailed {
            core,
            detail: format!("no image at {}: {e}", self.staging.display()),
        })
    }

    fn clear_staging(&mut self) -> Result<()> {
        if self.staging.exists() {
            warn!(
                "Deleting leftover staging file {}",
                self.staging.display()
            );
        }
        self.remove_staging()
    }
}
