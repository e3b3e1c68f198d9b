//! `lxtask run`: start a task and supervise it in the foreground.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use lxtask_common::config::DriverConfig;
use lxtask_common::spec::TaskSpec;
use lxtask_common::types::{ExitResult, TaskId, TaskResourceUsage};
use lxtask_runtime::Driver;
use lxtask_runtime::backend::lxc::LxcRuntime;
use lxtask_runtime::event::TaskEvent;
use lxtask_runtime::{logs, state};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::output::{format_event, format_exit, format_usage};
use crate::task_file::{TaskFile, prepare_task_dir};

/// Number of LXC log lines shown when a start fails.
const LOG_TAIL_LINES: usize = 20;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the task file.
    pub file: PathBuf,

    /// Seconds between resource usage reports; 0 disables them.
    #[arg(long, default_value_t = 10)]
    pub stats_interval: u64,

    /// Seconds to wait for the task to stop after Ctrl-C.
    #[arg(long, default_value_t = 10)]
    pub stop_timeout: u64,

    /// Leave the container in place after the task ends.
    #[arg(long)]
    pub keep: bool,

    /// Return once the task is running; reattach later with `lxtask recover`.
    #[arg(short, long)]
    pub detach: bool,
}

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

enum Outcome {
    Exited(ExitResult),
    Interrupted,
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the task cannot be started, or if it terminates
/// unsuccessfully.
pub async fn execute(args: RunArgs, mut config: DriverConfig) -> anyhow::Result<()> {
    print_header();
    if !LxcRuntime::is_installed() {
        anyhow::bail!("LXC tools not found on PATH (lxc-start is required)");
    }
    if args.keep {
        config.gc.container = false;
    }
    if args.detach && config.state_dir.is_none() {
        anyhow::bail!("--detach needs a state directory (--state-dir or state_dir in the config)");
    }

    let spec = TaskFile::load(&args.file)?.into_spec();
    prepare_task_dir(&spec.task_dir)?;
    let driver = Arc::new(Driver::new(config, Arc::new(LxcRuntime::new())));
    let mut events = driver.task_events();

    let id = spec.id.clone();
    let record = match driver.start_task(spec.clone()).await {
        Ok(record) => record,
        Err(e) => {
            print_log_tail(&spec);
            return Err(e.into());
        }
    };
    let status = driver.inspect_task(&id)?;
    eprintln!(
        "  {GREEN}\u{25cf}{RESET} {BOLD}{}{RESET} running in {} {DIM}(pid {}){RESET}",
        spec.name, record.container_name, status.pid
    );
    if let Some(dir) = &driver.config().state_dir {
        eprintln!("  {DIM}state {}{RESET}", state::state_path(dir, &id).display());
    }
    if args.detach {
        driver.shutdown();
        eprintln!();
        eprintln!("  Running detached. Use {BOLD}lxtask recover{RESET} with the state file to reattach.");
        return Ok(());
    }
    eprintln!("  {DIM}Press Ctrl-C to stop.{RESET}");
    eprintln!();

    let outcome = supervise(&driver, &id, &args, &mut events).await?;

    if matches!(outcome, Outcome::Interrupted) {
        eprintln!();
        eprintln!("  {YELLOW}Stopping{RESET} {}...", spec.name);
        driver
            .stop_task(&id, Duration::from_secs(args.stop_timeout))
            .await?;
    }
    driver.destroy_task(&id, true).await?;
    drain(&mut events);
    driver.shutdown();

    match outcome {
        Outcome::Exited(result) if !result.successful() => {
            print_log_tail(&spec);
            anyhow::bail!("task {} failed: {}", spec.name, format_exit(&result))
        }
        Outcome::Exited(result) => {
            eprintln!("  {GREEN}\u{2713}{RESET} {} finished, {}", spec.name, format_exit(&result));
            Ok(())
        }
        Outcome::Interrupted => {
            eprintln!("  {GREEN}\u{2713}{RESET} {} stopped", spec.name);
            Ok(())
        }
    }
}

/// Prints events and usage until the task exits or Ctrl-C is pressed.
async fn supervise(
    driver: &Driver,
    id: &TaskId,
    args: &RunArgs,
    events: &mut broadcast::Receiver<TaskEvent>,
) -> anyhow::Result<Outcome> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let mut exit = driver.wait_task(id, cancel.child_token())?;
    let mut stats = if args.stats_interval == 0 {
        None
    } else {
        let interval = Duration::from_secs(args.stats_interval);
        Some(driver.task_stats(id, interval, cancel.child_token())?)
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = exit.recv() => {
                return Ok(result.map_or(Outcome::Interrupted, Outcome::Exited));
            }
            signal = &mut ctrl_c => {
                signal?;
                return Ok(Outcome::Interrupted);
            }
            Some(usage) = recv_usage(&mut stats) => {
                eprintln!("  {DIM}{}{RESET}", format_usage(&usage));
            }
            event = events.recv() => match event {
                Ok(event) => eprintln!("  {}", format_event(&event)),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "event subscriber lagged"),
                Err(RecvError::Closed) => {}
            },
        }
    }
}

async fn recv_usage(stats: &mut Option<mpsc::Receiver<TaskResourceUsage>>) -> Option<TaskResourceUsage> {
    match stats {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Prints events that are already buffered without waiting for more.
fn drain(events: &mut broadcast::Receiver<TaskEvent>) {
    while let Ok(event) = events.try_recv() {
        eprintln!("  {}", format_event(&event));
    }
}

fn print_header() {
    eprintln!();
    eprintln!("  {BOLD}lxtask{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();
}

fn print_log_tail(spec: &TaskSpec) {
    match logs::tail_logs(&spec.task_dir.dir, &spec.name, LOG_TAIL_LINES) {
        Ok(lines) if !lines.is_empty() => {
            let path = logs::log_path(&spec.task_dir.dir, &spec.name);
            eprintln!("  {DIM}Last lines of {}:{RESET}", path.display());
            for line in lines {
                eprintln!("    {line}");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "could not read lxc log"),
    }
}
