//! # lxtask
//!
//! Runs a single task inside an LXC container and supervises it until it
//! exits, or renders the configuration it would receive.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod commands;
mod output;
mod task_file;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::{Cli, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    commands::execute(cli).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
