//! `lxtask fingerprint`: report whether the driver can run tasks here.

use std::sync::Arc;

use clap::Args;
use lxtask_common::config::DriverConfig;
use lxtask_common::types::HealthState;
use lxtask_runtime::Driver;
use lxtask_runtime::backend::lxc::LxcRuntime;

/// Arguments for the `fingerprint` command.
#[derive(Args, Debug)]
pub struct FingerprintArgs {
    /// Print the fingerprint and capabilities as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `fingerprint` command.
///
/// # Errors
///
/// Returns an error if the fingerprint cannot be serialized.
pub async fn execute(args: FingerprintArgs, config: DriverConfig) -> anyhow::Result<()> {
    let driver = Driver::new(config, Arc::new(LxcRuntime::new()));
    let fp = driver.build_fingerprint().await;

    if args.json {
        let value = serde_json::json!({
            "fingerprint": fp,
            "capabilities": driver.capabilities(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let health = match fp.health {
        HealthState::Healthy => "healthy",
        HealthState::Undetected => "undetected",
    };
    println!("health:   {health} ({})", fp.description);
    if !fp.version.is_empty() {
        println!("version:  {}", fp.version);
    }
    println!("volumes:  {}", if fp.volumes_enabled { "enabled" } else { "disabled" });
    Ok(())
}
