//! CLI command definitions and dispatch.

pub mod fingerprint;
pub mod plan;
pub mod recover;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use lxtask_common::config::DriverConfig;
use lxtask_common::spec::NetworkMode;

/// Default location of the driver configuration file.
const DEFAULT_CONFIG_FILE: &str = "/etc/lxtask/driver.yaml";

/// lxtask: supervise tasks running in LXC containers.
#[derive(Parser, Debug)]
#[command(name = "lxtask", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Driver configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, env = "LXTASK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Container storage path, overriding the configuration file.
    #[arg(long, global = true)]
    pub lxc_path: Option<PathBuf>,

    /// Default network mode, overriding the configuration file.
    #[arg(long, global = true, value_parser = parse_network_mode)]
    pub network_mode: Option<NetworkMode>,

    /// Directory receiving persisted task state.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Format of diagnostic logs written to stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Diagnostic log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a task and supervise it until it exits or Ctrl-C is pressed.
    Run(run::RunArgs),
    /// Print the container directives a task would receive.
    Plan(plan::PlanArgs),
    /// Report whether LXC is usable on this host.
    Fingerprint(fingerprint::FingerprintArgs),
    /// Re-attach to a task from its persisted state and report its status.
    Recover(recover::RecoverArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Run(args) => run::execute(args, config).await,
        Command::Plan(args) => plan::execute(args, &config).await,
        Command::Fingerprint(args) => fingerprint::execute(args, config).await,
        Command::Recover(args) => recover::execute(args, config).await,
    }
}

fn parse_network_mode(s: &str) -> Result<NetworkMode, String> {
    s.parse().map_err(|e: lxtask_common::error::LxtaskError| e.to_string())
}

/// Loads the driver configuration and applies command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<DriverConfig> {
    let mut config = read_config(&cli.config)?;
    if let Some(path) = &cli.lxc_path {
        config.lxc_path = Some(path.clone());
    }
    if let Some(mode) = cli.network_mode {
        config.network_mode = mode;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<DriverConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(DriverConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(DriverConfig::default());
    }
    serde_yaml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let cfg = read_config(Path::new("/nonexistent/lxtask.yaml")).unwrap();
        assert_eq!(cfg, DriverConfig::default());
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("driver.yaml");
        std::fs::write(&file, "network_mode: bridge\nlxc_path: /srv/lxc\n").unwrap();

        let cli = parse(&[
            "lxtask",
            "--config",
            file.to_str().unwrap(),
            "--network-mode",
            "host",
            "fingerprint",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.network_mode, NetworkMode::Host);
        assert_eq!(cfg.lxc_path, Some(PathBuf::from("/srv/lxc")));
    }

    #[test]
    fn invalid_network_mode_flag_is_rejected() {
        let err = Cli::try_parse_from(["lxtask", "--network-mode", "nat", "fingerprint"]).unwrap_err();
        assert!(err.to_string().contains("undefined"));
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("driver.yaml");
        std::fs::write(&file, "network_mode: nat\n").unwrap();
        assert!(read_config(&file).is_err());
    }
}
