//! tracker-ota: pushes one firmware image to every tracker paired with a
//! USB-attached gateway.
//!
//! ## Subcommands
//!
//! - `update` (default): run a bulk OTA update using `config.json` plus flags
//! - `enter-bootloader`: reset the gateway into its ROM bootloader for flashing

mod logging;

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracker_ota_core::bootloader::{enter_bootloader, STEP_DELAY};
use tracker_ota_core::config::{self, DEFAULT_CONFIG_FILE};
use tracker_ota_core::{
    discover_gateway, ConfigSource, ConfigValue, EspOtaPusher, Orchestrator, OtaError, RunToken,
    SerialError,
};

#[derive(Parser)]
#[command(name = "tracker-ota")]
#[command(about = "Bulk OTA firmware updates for gateway-paired trackers")]
#[command(version)]
struct Cli {
    /// Config file; an example is written here if it does not exist
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    update: UpdateArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update every tracker that answers the gateway's broadcast
    Update(UpdateArgs),

    /// Put the attached gateway into its bootloader
    EnterBootloader,
}

/// Per-run overrides; each flag wins over the matching config key.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct UpdateArgs {
    /// UDP port trackers hail (PORT)
    #[arg(long)]
    port: Option<u16>,

    /// This machine's IPv4 address as seen by the trackers (HOST)
    #[arg(long)]
    host: Option<String>,

    /// ArduinoOTA port on the trackers (OTAPORT)
    #[arg(long)]
    ota_port: Option<u16>,

    /// ArduinoOTA password (OTAPASSWORD)
    #[arg(long)]
    ota_password: Option<String>,

    /// Firmware image to push (FILE)
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// WiFi network the trackers join (SSID)
    #[arg(long)]
    ssid: Option<String>,

    /// WiFi password (PASSWORD)
    #[arg(long)]
    password: Option<String>,

    /// Per-tracker upload deadline, 0 disables it (SESSION_TIMEOUT_SECS)
    #[arg(long, value_name = "SECS")]
    session_timeout_secs: Option<u64>,
}

impl UpdateArgs {
    fn into_overrides(self) -> ConfigSource {
        ConfigSource {
            port: self.port.map(|port| ConfigValue::Number(port.into())),
            host: self.host.map(ConfigValue::Text),
            ota_port: self.ota_port.map(|port| ConfigValue::Number(port.into())),
            ota_password: self.ota_password.map(ConfigValue::Text),
            file: self
                .file
                .map(|path| ConfigValue::Text(path.to_string_lossy().into_owned())),
            ssid: self.ssid.map(ConfigValue::Text),
            password: self.password.map(ConfigValue::Text),
            session_timeout_secs: self.session_timeout_secs.map(ConfigValue::Number),
        }
    }
}

/// Picks the command to run. Top-level update flags only apply to the
/// implicit update; combined with an explicit subcommand they are rejected.
fn resolve_command(command: Option<Commands>, top_level: UpdateArgs) -> Result<Commands, clap::Error> {
    match command {
        None => Ok(Commands::Update(top_level)),
        Some(command) if top_level == UpdateArgs::default() => Ok(command),
        Some(_) => Err(Cli::command().error(
            ErrorKind::ArgumentConflict,
            "update flags must follow the `update` subcommand, or be used without a subcommand",
        )),
    }
}

fn main() {
    let cli = Cli::parse();
    let command = resolve_command(cli.command, cli.update).unwrap_or_else(|e| e.exit());
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    match command {
        Commands::EnterBootloader => {
            if let Err(e) = run_enter_bootloader() {
                tracing::error!(error = %e, "Failed to enter bootloader");
                std::process::exit(1);
            }
        }
        Commands::Update(args) => update_or_exit(&cli.config, args),
    }
}

fn update_or_exit(config_path: &Path, args: UpdateArgs) {
    if let Err(e) = run_update(config_path, args) {
        tracing::error!(error = %e, "OTA update failed");
        std::process::exit(1);
    }
}

fn run_update(config_path: &Path, args: UpdateArgs) -> Result<(), OtaError> {
    let token = RunToken::generate();
    info!(token = %token.to_hex(), "Generated auth token");

    let config = config::load(config_path, args.into_overrides())?;
    info!(config = ?config, "Loaded configuration");

    Orchestrator::new(config, token, Arc::new(EspOtaPusher::default())).run(discover_gateway)
}

fn run_enter_bootloader() -> Result<(), SerialError> {
    let mut gateway = discover_gateway()?;
    info!(port = gateway.path(), "Resetting gateway into bootloader");
    enter_bootloader(&mut gateway, STEP_DELAY)?;
    info!("Gateway is in bootloader mode");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs_update_with_default_config() {
        let cli = Cli::try_parse_from(["tracker-ota"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(cli.update.into_overrides(), ConfigSource::default());
    }

    #[test]
    fn top_level_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "tracker-ota",
            "--port",
            "9100",
            "--host",
            "10.0.0.5",
            "--file",
            "fw.bin",
            "--session-timeout-secs",
            "0",
        ])
        .unwrap();
        let overrides = cli.update.into_overrides();
        assert_eq!(overrides.port, Some(ConfigValue::Number(9100)));
        assert_eq!(overrides.host, Some(ConfigValue::Text("10.0.0.5".to_string())));
        assert_eq!(overrides.file, Some(ConfigValue::Text("fw.bin".to_string())));
        assert_eq!(overrides.session_timeout_secs, Some(ConfigValue::Number(0)));
        assert_eq!(overrides.ssid, None);
    }

    #[test]
    fn update_subcommand_accepts_the_same_flags() {
        let cli = Cli::try_parse_from([
            "tracker-ota",
            "--config",
            "other.json",
            "update",
            "--ssid",
            "lab",
            "--ota-port",
            "3232",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
        let Some(Commands::Update(args)) = cli.command else {
            panic!("expected update subcommand");
        };
        let overrides = args.into_overrides();
        assert_eq!(overrides.ssid, Some(ConfigValue::Text("lab".to_string())));
        assert_eq!(overrides.ota_port, Some(ConfigValue::Number(3232)));
    }

    #[test]
    fn bare_flags_resolve_to_update() {
        let cli = Cli::try_parse_from(["tracker-ota", "--ssid", "lab"]).unwrap();
        let Ok(Commands::Update(args)) = resolve_command(cli.command, cli.update) else {
            panic!("expected implicit update");
        };
        assert_eq!(args.ssid.as_deref(), Some("lab"));
    }

    #[test]
    fn global_flags_combine_with_update_subcommand() {
        let cli = Cli::try_parse_from([
            "tracker-ota",
            "--config",
            "other.json",
            "--log-dir",
            "logs",
            "update",
            "--port",
            "9100",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
        assert_eq!(cli.log_dir, Some(PathBuf::from("logs")));
        let Ok(Commands::Update(args)) = resolve_command(cli.command, cli.update) else {
            panic!("expected update subcommand");
        };
        assert_eq!(args.port, Some(9100));
    }

    #[test]
    fn update_flags_before_subcommand_are_rejected() {
        let cli = Cli::try_parse_from(["tracker-ota", "--port", "9100", "enter-bootloader"]).unwrap();
        let err = resolve_command(cli.command, cli.update).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn bootloader_subcommand_parses() {
        let cli = Cli::try_parse_from(["tracker-ota", "enter-bootloader", "--log-dir", "logs"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::EnterBootloader)));
        assert_eq!(cli.log_dir, Some(PathBuf::from("logs")));
    }
}
