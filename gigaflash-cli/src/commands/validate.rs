//! Standalone validation command implementation.

use anyhow::Result;
use console::style;
use gigaflash::{NativeBus, SerialNumber, Verdict, protocol::probe};

use crate::config::Config;
use crate::serial::select_board;
use crate::{Cli, CliError, parse_serial};

/// Short description of a verdict that did not pass.
pub(crate) fn failure_message(verdict: &Verdict) -> Option<String> {
    match verdict {
        Verdict::Pass(_) => None,
        Verdict::Mismatch {
            expected, actual, ..
        } => Some(format!(
            "board reports serial number '{actual}', expected '{expected}'"
        )),
        Verdict::UnexpectedResponse { command, response } => {
            Some(format!("board answered {command} with '{response}'"))
        },
    }
}

/// Validate command implementation.
pub(crate) fn cmd_validate(
    cli: &Cli,
    config: &Config,
    serial: Option<&str>,
    json: bool,
) -> Result<()> {
    let serial = serial.map(parse_serial).transpose()?;
    let board = select_board(&cli.serial_options(), config)?;

    let verdict = probe::validate(
        &mut NativeBus,
        &board.path,
        serial.as_ref().map(SerialNumber::as_str),
    )?;

    if json {
        let output = serde_json::json!({
            "ok": verdict.is_pass(),
            "data": {
                "port": board.path,
                "verdict": serde_json::to_value(&verdict)?,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
    } else if let Verdict::Pass(identity) = &verdict {
        if !cli.quiet {
            eprintln!(
                "{} {} on {}: serial number {}",
                style("✓").green(),
                identity.idn,
                board.path,
                style(&identity.serial).cyan().bold()
            );
        }
    }

    match failure_message(&verdict) {
        None => Ok(()),
        Some(message) => Err(CliError::ValidationFailed(message).into()),
    }
}
