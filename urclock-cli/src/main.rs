//! urclock CLI - Command-line uploader for AVR urboot and optiboot bootloaders.
//!
//! ## Features
//!
//! - Upload raw binaries and Intel HEX files next to a vector bootloader
//! - Show part, bootloader geometry and the last upload's metadata
//! - Read flash or EEPROM into a file
//! - Chip erase, emulated where the bootloader cannot erase
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use urclock::{BoardIdLocation, Memory};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation the argument parser could not catch (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// No port or no bootloader behind it (exit 4).
    #[error("{0}")]
    DeviceNotFound(String),
    /// Stopped by Ctrl-C (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// urclock - upload firmware through urboot and optiboot serial bootloaders.
///
/// Environment variables:
///   URCLOCK_PORT    - Default serial port
///   URCLOCK_BAUD    - Default baud rate (default: 115200)
///   URCLOCK_PART    - Part name, e.g. ATmega328P
#[derive(Parser)]
#[command(name = "urclock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    urclock -p /dev/ttyUSB0 upload blink.hex\n  \
    urclock -p /dev/ttyUSB0 --part ATmega328P --bootsize 512 info\n  \
    urclock -p COM3 read eeprom eeprom.bin")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if exactly one is present).
    #[arg(short, long, global = true, env = "URCLOCK_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "URCLOCK_BAUD")]
    baud: Option<u32>,

    /// Part name, for bootloaders that do not identify the part.
    #[arg(long, global = true, env = "URCLOCK_PART")]
    part: Option<String>,

    /// Bootloader size in bytes, overriding what the device says.
    #[arg(long, global = true)]
    bootsize: Option<u32>,

    /// Vector bootloader vector number; -1 for a non-vector bootloader.
    #[arg(long, global = true, allow_negative_numbers = true)]
    vectornum: Option<i32>,

    /// Assume the bootloader can read and write EEPROM.
    #[arg(long, global = true)]
    eepromrw: bool,

    /// Emulate chip erase by rewriting all application flash.
    #[arg(long, global = true)]
    emulate_ce: bool,

    /// Extra milliseconds to wait after reset; may be negative.
    #[arg(long, global = true, allow_negative_numbers = true)]
    delay: Option<i64>,

    /// Do not pulse DTR/RTS to reset the board.
    #[arg(long, global = true)]
    noautoreset: bool,

    /// Send well-formed get-sync requests only.
    #[arg(long, global = true)]
    strict: bool,

    /// Proceed despite contradicting overrides or a wrong reset vector.
    #[arg(long, global = true)]
    force: bool,

    /// Board identity location, e.g. E.257.6 or F.-4.2.
    #[arg(long, global = true, value_name = "LOCATION")]
    board_id: Option<BoardIdLocation>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Memory a command operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MemoryArg {
    /// Program flash.
    Flash,
    /// Data EEPROM.
    Eeprom,
}

impl From<MemoryArg> for Memory {
    fn from(mem: MemoryArg) -> Self {
        match mem {
            MemoryArg::Flash => Memory::Flash,
            MemoryArg::Eeprom => Memory::Eeprom,
        }
    }
}

/// Upload switches.
#[derive(clap::Args, Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
struct UploadArgs {
    /// Raw binary, or Intel HEX when the name ends in .hex.
    file: PathBuf,

    /// Upload the file as is, without vector patching or metadata.
    #[arg(long)]
    restore: bool,

    /// Write no metadata at all.
    #[arg(long)]
    nometadata: bool,

    /// Record the store location only.
    #[arg(long)]
    nodate: bool,

    /// Record date and store location but no filename.
    #[arg(long)]
    nofilename: bool,

    /// Write only the no-metadata marker byte.
    #[arg(long)]
    nostore: bool,

    /// Blank the store between application and metadata.
    #[arg(long)]
    initstore: bool,

    /// Name recorded in the metadata instead of the file name.
    #[arg(long)]
    title: Option<String>,

    /// Chip erase before uploading.
    #[arg(short, long)]
    erase: bool,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show part, bootloader and the last upload.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Upload an application.
    Upload(UploadArgs),

    /// Read flash or EEPROM into a raw binary file.
    Read {
        /// Memory to read.
        #[arg(value_enum)]
        memory: MemoryArg,

        /// Output file.
        output: PathBuf,

        /// First byte to read.
        #[arg(long, value_parser = parse_int, default_value = "0")]
        address: u32,

        /// Number of bytes; up to the end of the memory if omitted.
        #[arg(long, value_parser = parse_int)]
        length: Option<u32>,
    },

    /// Erase the application flash.
    Erase,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Parse a decimal or 0x-prefixed hexadecimal number.
fn parse_int(s: &str) -> Result<u32, String> {
    let s = s.trim();
    match s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex number: {e}")),
        None => s
            .parse()
            .map_err(|e| format!("Invalid number: {e}")),
    }
}

/// Exit code for a failed run.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::DeviceNotFound(_) => 4,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<urclock::Error>() {
        Some(urclock::Error::Interrupted) => 130,
        Some(urclock::Error::Config(_)) => 3,
        Some(urclock::Error::SyncFailure { .. } | urclock::Error::Serial(_)) => 4,
        _ => 1,
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

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
        "urclock v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    urclock::set_interrupt_checker(was_interrupted);

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info { json } => commands::info::cmd_info(&cli, &config, *json),
        Commands::Upload(args) => commands::upload::cmd_upload(&cli, &config, args),
        Commands::Read {
            memory,
            output,
            address,
            length,
        } => commands::upload::cmd_read(&cli, &config, (*memory).into(), output, *address, *length),
        Commands::Erase => commands::upload::cmd_erase(&cli, &config),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
    }
}
