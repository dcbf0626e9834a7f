//! canflash CLI - Command-line tool for flashing microcontrollers over CAN.
//!
//! ## Features
//!
//! - Flash raw firmware binaries through the CAN bootloader
//! - Discover bootloader nodes on the bus
//! - Assign new board addresses
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use canflash::{BootloaderClient, DeviceFamily, ProtocolConfig, SlcanPort};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if progress animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Default SLCAN adapter port.
#[cfg(windows)]
const DEFAULT_PORT: &str = "COM0";
/// Default SLCAN adapter port.
#[cfg(not(windows))]
const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// canflash - Flash firmware to microcontroller nodes over a shared CAN bus.
///
/// Environment variables:
///   CANFLASH_PORT              - SLCAN adapter serial port
///   CANFLASH_BITRATE           - CAN bitrate (default: 500000)
///   CANFLASH_FAMILY            - Bootloader family (standard, legacy)
///   CANFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "canflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// SLCAN adapter serial port [default: /dev/ttyACM0, COM0 on Windows].
    #[arg(short, long, global = true, env = "CANFLASH_PORT")]
    port: Option<String>,

    /// CAN bitrate in bit/s [default: 500000].
    #[arg(long, global = true, env = "CANFLASH_BITRATE")]
    bitrate: Option<u32>,

    /// Bootloader family (standard, legacy) [default: standard].
    #[arg(long, global = true, env = "CANFLASH_FAMILY", value_parser = parse_family)]
    family: Option<DeviceFamily>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CANFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware binary to a board.
    Flash {
        /// Address of the target board.
        #[arg(short, long)]
        board: u8,

        /// Path to the firmware binary.
        firmware: PathBuf,

        /// Attempts per page before giving up [default: 3].
        #[arg(long)]
        page_retries: Option<u32>,

        /// Whole-flash attempts [default: 1].
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Assign a new address to a board.
    SetId {
        /// Current address of the board.
        #[arg(short, long)]
        board: u8,

        /// New address (0-254).
        #[arg(short = 'i', long = "id")]
        new_id: u16,
    },

    /// Discover bootloader nodes on the bus.
    List {
        /// Output board addresses as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Parse a bootloader family name.
fn parse_family(s: &str) -> Result<DeviceFamily, String> {
    DeviceFamily::from_name(s)
        .ok_or_else(|| format!("Unknown bootloader family '{s}'. Expected 'standard' or 'legacy'"))
}

/// CLI failure categories with dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration.
    #[error("{0}")]
    Config(String),
    /// Bus or board not answering.
    #[error("{0}")]
    Device(String),
    /// User aborted at a prompt.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }

    let lib_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<canflash::Error>());
    match lib_err {
        Some(canflash::Error::InvalidAddress(_)) => 2,
        Some(canflash::Error::Config(_)) => 3,
        Some(e) if e.is_device_error() => 4,
        _ => 1,
    }
}

/// Bus settings after merging flags, environment and config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BusSettings {
    /// Adapter serial port.
    pub port: String,
    /// CAN bitrate.
    pub bitrate: u32,
    /// Bootloader family.
    pub family: DeviceFamily,
}

impl BusSettings {
    /// Resolve settings; flags and environment win over config files.
    fn resolve(cli: &Cli, config: &Config) -> Self {
        Self {
            port: cli
                .port
                .clone()
                .or_else(|| config.bus.port.clone())
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            bitrate: cli
                .bitrate
                .or(config.bus.bitrate)
                .unwrap_or(canflash::port::slcan::DEFAULT_BITRATE),
            family: cli.family.or(config.bus.family).unwrap_or_default(),
        }
    }
}

/// Open the bus adapter and wrap it in a bootloader client.
pub(crate) fn open_client(
    cli: &Cli,
    config: &Config,
) -> Result<(BootloaderClient<SlcanPort>, BusSettings)> {
    let bus = BusSettings::resolve(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} bit/s ({} bootloader)",
            style("🔌").cyan(),
            style(&bus.port).green(),
            bus.bitrate,
            bus.family
        );
    }

    let port = SlcanPort::open(&bus.port, bus.bitrate)
        .with_context(|| format!("Failed to open CAN adapter on {}", bus.port))?;
    let client = BootloaderClient::new(port, ProtocolConfig::new(bus.family));
    Ok((client, bus))
}

fn main() {
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
        "canflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        if !path.exists() {
            return Err(CliError::Config(format!(
                "Config file {} does not exist",
                path.display()
            ))
            .into());
        }
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            board,
            firmware,
            page_retries,
            attempts,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            *board,
            firmware,
            page_retries.or(config.flash.page_retries),
            attempts.or(config.flash.attempts),
        ),
        Commands::SetId { board, new_id } => commands::set_id::cmd_set_id(cli, &config, *board, *new_id),
        Commands::List { json } => commands::list::cmd_list(cli, &config, *json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}
