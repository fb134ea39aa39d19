//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::Cli;

/// Binary name completions are generated for.
const BIN: &str = "gigaflash";

/// Line zsh needs to pick up `~/.zfunc`.
const ZSH_FPATH: &str = "fpath=(~/.zfunc $fpath)";

fn script(shell: Shell) -> Vec<u8> {
    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN, &mut buf);
    buf
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN, &mut io::stdout());
}

/// Shell named by a binary path such as `$SHELL`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())?;
    match name {
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        other => other.parse().ok(),
    }
}

fn detect_shell() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    (cfg!(windows) && env::var("PSModulePath").is_ok()).then_some(Shell::PowerShell)
}

fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

/// `$<var>` or `<home>/<fallback>`.
fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf> {
    if let Ok(dir) = env::var(var) {
        return Ok(PathBuf::from(dir));
    }
    Ok(fallback
        .iter()
        .fold(home_dir()?, |dir, part| dir.join(part)))
}

/// Where the completion script for `shell` is installed.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])?
            .join("bash-completion/completions")
            .join(BIN),
        Shell::Zsh => home_dir()?
            .join(".zfunc")
            .join(format!("_{BIN}")),
        Shell::Fish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("fish/completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("elvish/lib")
            .join(format!("{BIN}.elv")),
        Shell::PowerShell => match env::var("PROFILE") {
            Ok(profile) => Path::new(&profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join(format!("{BIN}.ps1")),
            Err(_) => home_dir()?
                .join(".config/powershell/completions")
                .join(format!("{BIN}.ps1")),
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Append the `fpath` setup to `~/.zshrc` unless it is already there.
fn ensure_zsh_fpath() -> Result<()> {
    let zshrc = home_dir()?.join(".zshrc");
    if fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(ZSH_FPATH)) {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions\n{ZSH_FPATH}\nautoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions for the current (or given) shell.
pub(crate) fn cmd_completions_install(shell: Option<Shell>) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => detect_shell().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             gigaflash completions --install bash",
        )?,
    };
    let path = install_path(shell)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, script(shell))
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {shell} completions to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "Add this to your PowerShell profile: {}",
            style(format!(". {}", path.display())).cyan()
        ),
        _ => eprintln!("Completions load automatically in new sessions."),
    }

    Ok(())
}
