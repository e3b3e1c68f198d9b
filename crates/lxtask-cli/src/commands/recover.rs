//! `lxtask recover`: re-attach to a task from its persisted state.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use lxtask_common::config::DriverConfig;
use lxtask_runtime::Driver;
use lxtask_runtime::backend::lxc::LxcRuntime;
use lxtask_runtime::state;

use crate::output::format_exit;

/// Arguments for the `recover` command.
#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Persisted task state file written by `lxtask run`.
    pub state_file: PathBuf,

    /// Print the recovered status as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `recover` command.
///
/// # Errors
///
/// Returns an error if the state file is unreadable or recovery fails.
pub async fn execute(args: RecoverArgs, config: DriverConfig) -> anyhow::Result<()> {
    let record = state::load_state(&args.state_file)?;
    let driver = Driver::new(config, Arc::new(LxcRuntime::new()));
    driver.recover_task(&record).await?;
    let status = driver.inspect_task(record.task_id())?;
    driver.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("task:       {}", status.id);
    println!("container:  {}", status.container_name);
    println!("state:      {}", status.state);
    println!("pid:        {}", status.pid);
    println!("started:    {}", status.started_at.to_rfc3339());
    if let Some(result) = &status.exit_result {
        println!("result:     {}", format_exit(result));
    }
    Ok(())
}
