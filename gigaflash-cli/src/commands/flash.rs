//! Flash and reserial command implementations.

use anyhow::Result;
use console::style;
use gigaflash::{Core, DeviceTarget, FlashPlan, RunReport, Step, Verdict};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::commands::validate::failure_message;
use crate::serial::select_board;
use crate::{Cli, CliError, parse_serial, use_fancy_output};

/// Steps reported by a full flash without a serial number.
const FLASH_STEPS: u64 = 9;

/// Steps reported by a reserial run.
const RESERIAL_STEPS: u64 = 8;

fn step_progress(cli: &Cli, total: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    target: DeviceTarget,
    serial: Option<&str>,
) -> Result<()> {
    let serial = serial.map(parse_serial).transpose()?;
    let dir = cli.firmware_dir(config);

    if !cli.quiet {
        eprintln!(
            "{} Loading {target} firmware from {}",
            style("📦").cyan(),
            dir.display()
        );
    }

    // Everything here runs before the board is touched.
    let plan = FlashPlan::prepare(&dir, target, serial).map_err(|e| {
        CliError::Usage(format!("cannot prepare {target} firmware: {e}"))
    })?;

    if !cli.quiet {
        eprintln!(
            "    {} {} core: {} bytes",
            style("•").dim(),
            Core::Primary,
            plan.primary().len()
        );
        eprintln!(
            "    {} {} core: {} bytes",
            style("•").dim(),
            Core::Secondary,
            plan.secondary().len()
        );
        match plan.serial() {
            Some(serial) => eprintln!("{} Serial number: {serial}", style("ℹ").blue()),
            None => eprintln!(
                "{} No serial number given, images are uploaded as shipped",
                style("ℹ").blue()
            ),
        }
    }

    let board = select_board(&cli.serial_options(), config)?;
    if !cli.quiet {
        eprintln!("{} Using board on {}", style("🔌").cyan(), board.path);
    }

    let total = FLASH_STEPS + u64::from(plan.serial().is_some());
    let pb = step_progress(cli, total);
    let mut orchestrator = cli.orchestrator(config);
    let result = orchestrator.run(&plan, Some(board), &mut |step: Step| {
        pb.set_message(step.to_string());
        pb.inc(1);
    });
    pb.finish_and_clear();

    report(cli, &result?)
}

/// Reserial command implementation.
pub(crate) fn cmd_reserial(cli: &Cli, config: &Config, serial: &str) -> Result<()> {
    let serial = parse_serial(serial)?;
    let board = select_board(&cli.serial_options(), config)?;
    if !cli.quiet {
        eprintln!(
            "{} Rewriting serial number on {} to {serial}",
            style("🔌").cyan(),
            board.path
        );
    }

    let pb = step_progress(cli, RESERIAL_STEPS);
    let mut orchestrator = cli.orchestrator(config);
    let result = orchestrator.reserialize(&serial, Some(board), &mut |step: Step| {
        pb.set_message(step.to_string());
        pb.inc(1);
    });
    pb.finish_and_clear();

    report(cli, &result?)
}

/// Print the outcome of a run; a run that did not validate fails with
/// [`CliError::ValidationFailed`].
fn report(cli: &Cli, report: &RunReport) -> Result<()> {
    if !cli.quiet {
        if let Some(patch) = &report.patch {
            if patch.unchanged() {
                eprintln!(
                    "{} Serial number already {}",
                    style("ℹ").blue(),
                    patch.value
                );
            } else {
                eprintln!(
                    "{} Serial number {} -> {}",
                    style("✓").green(),
                    patch.previous.value,
                    patch.value
                );
            }
        }
        eprintln!(
            "{} Flashed {} on {}",
            style("✓").green(),
            report
                .target
                .map_or("secondary core", |t| t.name()),
            report.board.path
        );
    }

    match &report.validation {
        Ok(Verdict::Pass(identity)) => {
            if !cli.quiet {
                eprintln!(
                    "\n{} Validation passed: {} (serial {})",
                    style("🎉").green().bold(),
                    identity.idn,
                    identity.serial
                );
            }
            Ok(())
        },
        Ok(verdict) => Err(CliError::ValidationFailed(
            failure_message(verdict).unwrap_or_else(|| format!("{verdict:?}")),
        )
        .into()),
        Err(e) => {
            Err(CliError::ValidationFailed(format!("validation did not complete: {e}")).into())
        },
    }
}
