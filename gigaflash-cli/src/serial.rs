//! Board selection.
//!
//! An explicit port (flag, environment or config) always wins. Otherwise
//! the ports matching the board identity are candidates: exactly one is
//! auto-selected, several are offered in a prompt, none is a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    gigaflash::{BoardIdentity, BoardPort, PortInfo, discover_ports, format_port_list, matching_ports},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for board selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if several boards are attached).
    pub non_interactive: bool,
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

fn no_board_message(identity: &BoardIdentity) -> String {
    format!(
        "no board found (product '{}', manufacturer '{}'); connect it or pass --port",
        identity.product, identity.manufacturer
    )
}

fn select_non_interactive(candidates: &[PortInfo], identity: &BoardIdentity) -> Result<BoardPort> {
    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Equal => Ok(BoardPort::from_info(&candidates[0])),
        Ordering::Greater => Err(usage_err(format!(
            "{} boards attached; pass --port to choose one",
            candidates.len()
        ))),
        Ordering::Less => Err(usage_err(no_board_message(identity))),
    }
}

/// Select the board to work on.
pub fn select_board(options: &SerialOptions, config: &Config) -> Result<BoardPort> {
    let explicit = options
        .port
        .as_ref()
        .or(config.board.port.as_ref());
    if let Some(name) = explicit {
        debug!("Using explicit port {name}");
        let ports = discover_ports()?;
        return Ok(find_port_by_name(&ports, name));
    }

    let identity = config.identity();
    let ports = discover_ports()?;
    let candidates: Vec<PortInfo> = matching_ports(&ports, &identity)
        .into_iter()
        .cloned()
        .collect();

    if options.non_interactive {
        return select_non_interactive(&candidates, &identity);
    }

    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(&candidates, &identity)
        },
        Ordering::Equal => {
            let board = BoardPort::from_info(&candidates[0]);
            info!("Auto-selected board on {}", board.path);
            Ok(board)
        },
        Ordering::Less => Err(usage_err(no_board_message(&identity))),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "several boards attached and no terminal to ask; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("board selection cancelled".to_string()).into()
            } else {
                usage_err(format!("board prompt failed: {io_err}"))
            }
        },
    }
}

/// Resolve a port name against the enumerated ports.
///
/// A name that is not enumerated is still used, pinned by path only.
fn find_port_by_name(ports: &[PortInfo], name: &str) -> BoardPort {
    ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| {
            ports
                .iter()
                .find(|p| {
                    p.name
                        .eq_ignore_ascii_case(name)
                })
        })
        .map_or_else(|| BoardPort::from_path(name), BoardPort::from_info)
}

/// Interactive board selection.
fn select_port_interactive(candidates: &[PortInfo], identity: &BoardIdentity) -> Result<BoardPort> {
    eprintln!(
        "{} {} boards detected",
        style("ℹ").blue(),
        candidates.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_port_list(candidates, identity)
        .into_iter()
        .zip(candidates)
        .map(|(label, port)| {
            let usb = port
                .serial_number
                .as_ref()
                .map(|s| format!(" {}", style(format!("[{s}]")).dim()))
                .unwrap_or_default();
            console::truncate_str(&format!("{label}{usb}"), max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board to flash")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => candidates
            .get(index)
            .map(BoardPort::from_info)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("board selection cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn giga(name: &str, usb_serial: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(0x2341),
            pid: Some(0x0266),
            manufacturer: Some("Arduino".to_string()),
            product: Some("Giga R1 WiFi".to_string()),
            serial_number: Some(usb_serial.to_string()),
        }
    }

    fn is_usage(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_)))
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.non_interactive);
    }

    #[test]
    fn test_non_interactive_single_board() {
        let board =
            select_non_interactive(&[giga("/dev/ttyACM0", "3C0035")], &BoardIdentity::default())
                .unwrap();
        assert_eq!(board.path, "/dev/ttyACM0");
        assert_eq!(board.usb_serial.as_deref(), Some("3C0035"));
    }

    #[test]
    fn test_non_interactive_several_boards_is_usage_error() {
        let err = select_non_interactive(
            &[giga("/dev/ttyACM0", "A"), giga("/dev/ttyACM1", "B")],
            &BoardIdentity::default(),
        )
        .unwrap_err();
        assert!(is_usage(&err));
        assert!(err.to_string().contains("--port"));
    }

    #[test]
    fn test_non_interactive_no_board_is_usage_error() {
        let err = select_non_interactive(&[], &BoardIdentity::default()).unwrap_err();
        assert!(is_usage(&err));
        assert!(err.to_string().contains("Giga"));
    }

    #[test]
    fn test_find_port_by_name_exact() {
        let ports = vec![giga("/dev/ttyACM0", "A"), giga("/dev/ttyACM1", "B")];
        let board = find_port_by_name(&ports, "/dev/ttyACM1");
        assert_eq!(board.usb_serial.as_deref(), Some("B"));
    }

    #[test]
    fn test_find_port_by_name_ignores_case() {
        let ports = vec![giga("COM7", "A")];
        let board = find_port_by_name(&ports, "com7");
        assert_eq!(board.path, "COM7");
        assert_eq!(board.usb_serial.as_deref(), Some("A"));
    }

    #[test]
    fn test_find_port_by_name_unknown_pins_by_path() {
        let board = find_port_by_name(&[], "/dev/ttyACM9");
        assert_eq!(board, BoardPort::from_path("/dev/ttyACM9"));
    }

    #[test]
    fn test_prompt_interrupt_is_cancelled() {
        let err = map_prompt_error(DialoguerError::IO(std::io::Error::from(
            std::io::ErrorKind::Interrupted,
        )));
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Cancelled(_))
        ));
    }
}
