//! Per-task LXC log files.
//!
//! The native runtime writes its own log next to the task's files so a
//! failed start can be diagnosed from the task directory.

use std::path::{Path, PathBuf};

use lxtask_common::error::{LxtaskError, Result};

/// Returns the LXC log file path of task `task_name`.
#[must_use]
pub fn log_path(task_dir: &Path, task_name: &str) -> PathBuf {
    task_dir.join(format!("{task_name}-lxc.log"))
}

/// Reads a task's LXC log.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(task_dir: &Path, task_name: &str) -> Result<String> {
    let path = log_path(task_dir, task_name);
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(&path).map_err(|e| LxtaskError::Io { path, source: e })
}

/// Returns the last `lines` lines of a task's LXC log.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn tail_logs(task_dir: &Path, task_name: &str, lines: usize) -> Result<Vec<String>> {
    let content = read_logs(task_dir, task_name)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| (*l).to_owned()).collect())
}
