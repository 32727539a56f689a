//! stcflash CLI - Command-line tool for programming STC 8051 microcontrollers.
//!
//! ## Features
//!
//! - Program raw binary and Intel HEX images
//! - Automatic model detection and baud rate negotiation
//! - Device information without programming
//! - Serial port listing with USB bridge detection
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use stcflash::port::{DEFAULT_AUTOISP_BAUD, DEFAULT_LOW_BAUD};
use stcflash::{ErrorKind, ProgramOptions, ProtocolVariant};
use thiserror::Error;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// stcflash - A cross-platform ISP tool for STC 8051 microcontrollers.
///
/// Environment variables:
///   STCFLASH_PORT      - Default serial port
///   STCFLASH_BAUD      - Discovery baud rate (default: 2400)
///   STCFLASH_PROTOCOL  - Protocol (auto, 89, 12c5a, 12c52, 12cx052)
#[derive(Parser)]
#[command(name = "stcflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "STCFLASH_PORT")]
    port: Option<String>,

    /// Baud rate used while waiting for the boot loader [default: 2400].
    #[arg(short, long, global = true, env = "STCFLASH_BAUD")]
    low_baud: Option<u32>,

    /// Protocol variant: auto, 89, 12 (alias of 12c5a), 12c5a, 12c52, 12cx052.
    #[arg(
        short = 'r',
        long,
        global = true,
        env = "STCFLASH_PROTOCOL",
        value_parser = parse_protocol
    )]
    protocol: Option<ProtocolChoice>,

    /// Baud rate the auto-ISP magic is sent at [default: 4800].
    #[arg(long, global = true, value_name = "BAUD")]
    aisp_baud: Option<u32>,

    /// Auto-ISP magic sequence that resets the target into its boot loader.
    #[arg(long, global = true, value_name = "MAGIC")]
    aisp_magic: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
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

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Program a firmware image (.bin, .hex, .ihx) into the device.
    Flash {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Erase the data EEPROM on the next download (true/false).
        #[arg(long, value_name = "BOOL")]
        erase_eeprom: Option<bool>,
    },

    /// Detect the device and show its information.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Protocol selection: `None` means derive it from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProtocolChoice(Option<ProtocolVariant>);

/// Parse a protocol name as given on the command line or in a config file.
fn parse_protocol(s: &str) -> Result<ProtocolChoice, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(ProtocolChoice(None));
    }
    ProtocolVariant::from_name(s)
        .map(|v| ProtocolChoice(Some(v)))
        .ok_or_else(|| {
            format!("Invalid protocol '{s}'. Expected one of: auto, 89, 12, 12c5a, 12c52, 12cx052")
        })
}

/// CLI-level errors.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad value outside of clap's reach (config file, combined options).
    #[error("{0}")]
    Usage(String),

    /// Firmware image has no data.
    #[error("Firmware image {0} is empty")]
    EmptyImage(PathBuf),
}

/// Fully resolved settings for a device session.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Serial port, if given by flag, environment or config.
    pub port: Option<String>,
    /// Discovery baud rate.
    pub low_baud: u32,
    /// Options handed to the programmer.
    pub options: ProgramOptions,
    /// Auto-ISP baud rate.
    pub aisp_baud: u32,
    /// Auto-ISP magic bytes, empty when disabled.
    pub aisp_magic: Vec<u8>,
    /// Suppress non-essential output.
    pub quiet: bool,
}

impl Settings {
    /// Merge command-line values (flags and environment) over the config file.
    fn resolve(cli: &Cli, config: &Config, erase_eeprom: Option<bool>) -> Result<Self> {
        let protocol = match (cli.protocol, &config.program.protocol) {
            (Some(choice), _) => choice.0,
            (None, Some(name)) => {
                parse_protocol(name)
                    .map_err(|e| CliError::Usage(format!("config: {e}")))?
                    .0
            },
            (None, None) => None,
        };

        let magic = cli
            .aisp_magic
            .as_ref()
            .or(config
                .autoisp
                .magic
                .as_ref())
            .map(|m| {
                m.as_bytes()
                    .to_vec()
            })
            .unwrap_or_default();

        Ok(Self {
            port: cli
                .port
                .clone()
                .or_else(|| {
                    config
                        .connection
                        .port
                        .clone()
                }),
            low_baud: cli
                .low_baud
                .or(config
                    .connection
                    .low_baud)
                .unwrap_or(DEFAULT_LOW_BAUD),
            options: ProgramOptions {
                protocol,
                erase_eeprom: erase_eeprom.or(config
                    .program
                    .erase_eeprom),
            },
            aisp_baud: cli
                .aisp_baud
                .or(config
                    .autoisp
                    .baud)
                .unwrap_or(DEFAULT_AUTOISP_BAUD),
            aisp_magic: magic,
            quiet: cli.quiet,
        })
    }
}

/// Map an error to the process exit status.
///
/// 1 generic, 3 transport, 4 device, 5 protocol, 6 image. Usage errors
/// detected by clap exit with 2 before we get here.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::EmptyImage(_) => 6,
        };
    }
    match err
        .downcast_ref::<stcflash::Error>()
        .map(stcflash::Error::kind)
    {
        Some(ErrorKind::Transport) => 3,
        Some(ErrorKind::Device) => 4,
        Some(ErrorKind::Protocol) => 5,
        Some(ErrorKind::Image) => 6,
        Some(ErrorKind::Other) | None => 1,
    }
}

/// Log filter for the given verbosity.
fn log_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            erase_eeprom,
        } => {
            let settings = Settings::resolve(cli, &config, *erase_eeprom)?;
            commands::flash::cmd_flash(&settings, firmware)
        },
        Commands::Info { json } => {
            let settings = Settings::resolve(cli, &config, None)?;
            commands::info::cmd_info(&settings, *json)
        },
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level(cli.verbose, cli.quiet)))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "stcflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use stcflash::{Error, Step};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "stcflash",
            "--port",
            "/dev/ttyUSB0",
            "-r",
            "89",
            "flash",
            "firmware.hex",
            "--erase-eeprom",
            "true",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.protocol, Some(ProtocolChoice(Some(ProtocolVariant::V89))));
        if let Commands::Flash {
            firmware,
            erase_eeprom,
        } = cli.command
        {
            assert_eq!(firmware.to_str().unwrap(), "firmware.hex");
            assert_eq!(erase_eeprom, Some(true));
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["stcflash", "info", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true }));
    }

    #[test]
    fn test_cli_parse_list_ports() {
        let cli = Cli::try_parse_from(["stcflash", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: false }));
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "stcflash",
            "list-ports",
            "-l",
            "1200",
            "--aisp-baud",
            "9600",
            "--aisp-magic",
            "reset",
            "-vvv",
            "--config",
            "/tmp/stcflash.toml",
        ])
        .unwrap();
        assert_eq!(cli.low_baud, Some(1200));
        assert_eq!(cli.aisp_baud, Some(9600));
        assert_eq!(cli.aisp_magic.as_deref(), Some("reset"));
        assert_eq!(cli.verbose, 3);
        assert!(cli.config_path.is_some());
    }

    #[test]
    fn test_cli_invalid_protocol() {
        assert!(Cli::try_parse_from(["stcflash", "-r", "51", "info"]).is_err());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["stcflash"]).is_err());
    }

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("auto"), Ok(ProtocolChoice(None)));
        assert_eq!(parse_protocol("AUTO"), Ok(ProtocolChoice(None)));
        assert_eq!(
            parse_protocol("12"),
            Ok(ProtocolChoice(Some(ProtocolVariant::V12C5A)))
        );
        assert_eq!(
            parse_protocol("12cx052"),
            Ok(ProtocolChoice(Some(ProtocolVariant::V12Cx052)))
        );
        assert!(parse_protocol("stc15").is_err());
    }

    #[test]
    fn test_settings_defaults() {
        let cli = Cli::try_parse_from(["stcflash", "info"]).unwrap();
        let settings = Settings::resolve(&cli, &Config::default(), None).unwrap();
        assert_eq!(settings.low_baud, DEFAULT_LOW_BAUD);
        assert_eq!(settings.aisp_baud, DEFAULT_AUTOISP_BAUD);
        assert!(settings.aisp_magic.is_empty());
        assert_eq!(settings.options, ProgramOptions::default());
    }

    #[test]
    fn test_settings_flags_override_config() {
        let mut config = Config::default();
        config.connection.port = Some("COM3".to_string());
        config.connection.low_baud = Some(1200);
        config.program.protocol = Some("12c52".to_string());
        config.program.erase_eeprom = Some(true);
        config.autoisp.magic = Some("\u{12}4".to_string());

        let cli = Cli::try_parse_from(["stcflash", "-l", "4800", "flash", "fw.bin"]).unwrap();
        let settings = Settings::resolve(&cli, &config, Some(false)).unwrap();

        assert_eq!(settings.port.as_deref(), Some("COM3"));
        assert_eq!(settings.low_baud, 4800);
        assert_eq!(settings.options.protocol, Some(ProtocolVariant::V12C52));
        assert_eq!(settings.options.erase_eeprom, Some(false));
        assert_eq!(settings.aisp_magic, vec![0x12, b'4']);
    }

    #[test]
    fn test_settings_invalid_config_protocol() {
        let mut config = Config::default();
        config.program.protocol = Some("bogus".to_string());

        let cli = Cli::try_parse_from(["stcflash", "info"]).unwrap();
        let err = Settings::resolve(&cli, &config, None).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_codes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such port");
        assert_eq!(exit_code(&Error::Io(io).into()), 3);
        assert_eq!(
            exit_code(&Error::Timeout("no answer".into()).at(Step::Detect).into()),
            4
        );
        assert_eq!(exit_code(&Error::NoViableBaud.at(Step::Handshake).into()), 5);
        assert_eq!(
            exit_code(&Error::ImageDecode(stcflash::HexError::ChecksumError(3)).into()),
            6
        );
        assert_eq!(exit_code(&CliError::EmptyImage(PathBuf::from("a.bin")).into()), 6);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_through_context() {
        let err = anyhow::Error::from(Error::NoViableBaud).context("while programming");
        assert_eq!(exit_code(&err), 5);
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, false), "warn");
        assert_eq!(log_level(1, false), "info");
        assert_eq!(log_level(2, false), "debug");
        assert_eq!(log_level(5, false), "trace");
        assert_eq!(log_level(3, true), "error");
    }
}
