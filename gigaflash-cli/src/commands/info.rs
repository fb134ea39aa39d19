//! Firmware inspection, offline patch and port listing command implementations.

use {
    crate::{Cli, config::Config, parse_serial},
    anyhow::{Context, Result},
    console::style,
    gigaflash::{Error, FirmwareImage, SerialField, discover_ports, format_port_list},
    log::warn,
    std::path::Path,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = discover_ports().unwrap_or_else(|e| {
        warn!("Could not enumerate serial ports: {e}");
        Vec::new()
    });
    let identity = config.identity();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "board": identity.matches(p),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for line in format_port_list(&detected, &identity) {
            eprintln!("  {} {line}", style("•").green());
        }
    }

    Ok(())
}

/// Read the serial field, treating a missing marker as "no field".
fn serial_field(image: &FirmwareImage) -> Result<Option<SerialField>> {
    match image.serial_field() {
        Ok(field) => Ok(Some(field)),
        Err(Error::MarkerNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn field_json(field: Option<&SerialField>) -> serde_json::Value {
    field.map_or(serde_json::Value::Null, |f| {
        serde_json::json!({
            "offset": format!("0x{:08X}", f.offset),
            "value": f.value,
        })
    })
}

fn load(firmware: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = load(firmware)?;
    let field = serial_field(&image)?;

    if json {
        let info = serde_json::json!({
            "ok": true,
            "data": {
                "path": firmware.display().to_string(),
                "size": image.len(),
                "serial": field_json(field.as_ref()),
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style(firmware.display())
            .bold()
            .underlined()
    );
    eprintln!("  Size: {} bytes", image.len());
    match field {
        Some(field) => {
            eprintln!("  Serial number: {}", style(&field.value).cyan().bold());
            eprintln!("  Field offset:  0x{:08X}", field.offset);
        },
        None => eprintln!("  Serial number: {}", style("no serial field").dim()),
    }

    Ok(())
}

/// Patch command implementation.
pub(crate) fn cmd_patch(
    cli: &Cli,
    firmware: &Path,
    serial: &str,
    output: Option<&Path>,
) -> Result<()> {
    let serial = parse_serial(serial)?;
    let mut image = load(firmware)?;
    let outcome = image.patch_serial(serial.as_str())?;

    let destination = output.unwrap_or(firmware);
    image
        .write_to(destination)
        .with_context(|| format!("Failed to write {}", destination.display()))?;

    if !cli.quiet {
        if outcome.unchanged() {
            eprintln!(
                "{} {} already carries {serial}",
                style("ℹ").blue(),
                destination.display()
            );
        } else {
            eprintln!(
                "{} {} -> {} at 0x{:08X} ({})",
                style("✓").green(),
                outcome.previous.value,
                outcome.value,
                outcome.previous.offset,
                destination.display()
            );
        }
    }

    Ok(())
}
