//! Command implementations.

pub(crate) mod info;
pub(crate) mod upload;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use urclock::{NativePort, NativePortEnumerator, PortEnumerator, SerialConfig, Session, SessionOptions};

use crate::config::Config;
use crate::{Cli, CliError};

/// Baud rate when neither the command line nor a config file sets one.
const DEFAULT_BAUD: u32 = 115_200;

/// Combine command line and config file into session options.
pub(crate) fn session_options(cli: &Cli, config: &Config) -> SessionOptions {
    let autoreset = !cli.noautoreset
        && config
            .connection
            .autoreset
            .unwrap_or(true);

    SessionOptions {
        part: cli
            .part
            .clone()
            .or_else(|| config.upload.part.clone()),
        bootsize: cli.bootsize.or(config.upload.bootsize),
        vectornum: cli.vectornum.or(config.upload.vectornum),
        eepromrw: cli.eepromrw,
        emulate_ce: cli.emulate_ce,
        delay_ms: cli
            .delay
            .or(config.connection.delay)
            .unwrap_or(0),
        autoreset,
        strict: cli.strict,
        nometadata: config.upload.nometadata,
        force: cli.force,
        board_id: cli.board_id,
    }
}

/// Port given on the command line or in the config file, or the only port
/// present.
fn resolve_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone())
    {
        return Ok(port);
    }

    let ports = NativePortEnumerator::list_ports().unwrap_or_default();
    match ports.as_slice() {
        [only] => {
            info!("Using {}", only.name);
            Ok(only.name.clone())
        },
        [] => Err(CliError::DeviceNotFound("no serial port found; use --port".into()).into()),
        _ => Err(CliError::Usage(format!(
            "{} serial ports found; choose one with --port",
            ports.len()
        ))
        .into()),
    }
}

/// Open the port and get the bootloader into programming mode.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Session<NativePort>> {
    let name = resolve_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD);
    debug!("Opening {name} at {baud} baud");

    let port = NativePort::open(&SerialConfig::new(&name, baud))
        .map_err(|e| CliError::DeviceNotFound(format!("cannot open {name}: {e}")))?;
    let session = Session::open(port, session_options(cli, config))
        .with_context(|| format!("no bootloader answering on {name}"))?;

    if !cli.quiet {
        eprintln!(
            "{} {} on {name}",
            session.part().name,
            session.version_string()
        );
    }
    Ok(session)
}

/// Fail with the Ctrl-C exit code if the user asked to stop.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if crate::was_interrupted() {
        return Err(CliError::Cancelled("interrupted".into()).into());
    }
    Ok(())
}

/// Page or byte progress bar; hidden when quiet or not on a terminal.
pub(crate) fn progress_bar(cli: &Cli, len: u64, what: &str) -> ProgressBar {
    if cli.quiet || !crate::use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_message(what.to_string());
    pb
}
