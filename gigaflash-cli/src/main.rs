//! gigaflash CLI - Command-line tool for provisioning Arduino GIGA boards.
//!
//! ## Features
//!
//! - Flash both cores with a per-unit serial number patched in
//! - Re-serialize a board without re-flashing its firmware
//! - Validate a running board over its command interface
//! - Inspect and patch firmware files offline
//! - Interactive board selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use gigaflash::{DeviceTarget, DfuUtil, FlashOrchestrator, NativeBus, SerialNumber};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// gigaflash - Serial-number provisioning and DFU flashing for Arduino GIGA boards.
///
/// Environment variables:
///   GIGAFLASH_PORT              - Serial port of the board
///   GIGAFLASH_FIRMWARE_DIR      - Directory with firmwareM7.bin / firmwareM4_<target>.bin
///   GIGAFLASH_DFU_UTIL          - dfu-util executable
///   GIGAFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "gigaflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port of the board (auto-detected if not specified).
    #[arg(short, long, global = true, env = "GIGAFLASH_PORT")]
    port: Option<String>,

    /// Firmware directory.
    #[arg(long, global = true, value_name = "DIR", env = "GIGAFLASH_FIRMWARE_DIR")]
    firmware_dir: Option<PathBuf>,

    /// dfu-util executable.
    #[arg(long, global = true, value_name = "PATH", env = "GIGAFLASH_DFU_UTIL")]
    dfu_util: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "GIGAFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Hardware variants.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    /// Current production hardware.
    #[value(name = "new_hardware")]
    NewHardware,
    /// First hardware revision.
    #[value(name = "old_hardware")]
    OldHardware,
    /// New shield with the old DAC/ADC stage.
    #[value(name = "new_shield_old_dac_adc")]
    NewShieldOldDacAdc,
}

impl From<Target> for DeviceTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::NewHardware => DeviceTarget::NewHardware,
            Target::OldHardware => DeviceTarget::OldHardware,
            Target::NewShieldOldDacAdc => DeviceTarget::NewShieldOldDacAdc,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash both cores, patching the serial number into the secondary image.
    Flash {
        /// Hardware variant.
        #[arg(value_enum)]
        target: Target,

        /// Serial number token (up to 3 characters, e.g. 42) or full value
        /// (DA_2025_042). Without it the images are uploaded as shipped.
        serial: Option<String>,
    },

    /// Rewrite the serial number of the firmware already on the board.
    Reserial {
        /// Serial number token or full value.
        serial: String,
    },

    /// Run the validation handshake against a running board.
    Validate {
        /// Expected serial number; without it only the NOP echo is checked.
        serial: Option<String>,

        /// Output the result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show the serial number field of a firmware file.
    Info {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Patch the serial number of a firmware file without flashing it.
    Patch {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Serial number token or full value.
        serial: String,

        /// Write the patched image here instead of in place.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad input or setup, detected before touching the board.
    #[error("{0}")]
    Usage(String),
    /// Flashing completed but the board did not validate.
    #[error("{0}")]
    ValidationFailed(String),
    /// The operator aborted a prompt.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::ValidationFailed(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

/// Parse an operator-supplied serial number; malformed input is a usage error.
pub(crate) fn parse_serial(input: &str) -> Result<SerialNumber> {
    SerialNumber::parse(input).map_err(|e| CliError::Usage(e.to_string()).into())
}

impl Cli {
    /// Firmware directory: flag/env first, then config.
    pub(crate) fn firmware_dir(&self, config: &Config) -> PathBuf {
        self.firmware_dir
            .clone()
            .unwrap_or_else(|| config.firmware_dir())
    }

    /// Board selection options from the global flags.
    pub(crate) fn serial_options(&self) -> serial::SerialOptions {
        serial::SerialOptions {
            port: self.port.clone(),
            non_interactive: self.non_interactive,
        }
    }

    /// Build the orchestrator for the real host.
    pub(crate) fn orchestrator(&self, config: &Config) -> FlashOrchestrator<NativeBus, DfuUtil> {
        let mut tool = DfuUtil::new(config.staging_file());
        if let Some(program) = self
            .dfu_util
            .as_ref()
            .or(config.flash.dfu_util.as_ref())
        {
            tool = tool.with_program(program);
        }
        FlashOrchestrator::new(NativeBus, tool)
            .with_identity(config.identity())
            .with_timing(config.timing())
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "gigaflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Flash { target, serial } => {
            commands::flash::cmd_flash(cli, config, (*target).into(), serial.as_deref())
        },
        Commands::Reserial { serial } => commands::flash::cmd_reserial(cli, config, serial),
        Commands::Validate { serial, json } => {
            commands::validate::cmd_validate(cli, config, serial.as_deref(), *json)
        },
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::Patch {
            firmware,
            serial,
            output,
        } => commands::info::cmd_patch(cli, firmware, serial, output.as_deref()),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(config, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `gigaflash completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}
